use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper::{header, Method, Request, Uri};
use hyper_util::rt::TokioIo;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::socket::{dial_from, resolve_addr};
use crate::{AnyError, Cancelled};

/// The address packet this party posts to the bridge.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SelfInfo {
    #[serde(rename = "priAddr")]
    pub pri_addr: String,
    #[serde(rename = "chanName")]
    pub chan_name: String,
    #[serde(rename = "nPlan", skip_serializing_if = "Option::is_none")]
    pub n_plan: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Vec<String>>,
    #[serde(rename = "tsAddr", skip_serializing_if = "Option::is_none")]
    pub ts_addr: Option<String>,
}

/// One address the peer may be reachable at: its own view (`pri_addr`)
/// and the NAT-translated view the bridge observed (`pub_addr`).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AddrPair {
    #[serde(rename = "priAddr")]
    pub pri_addr: String,
    #[serde(rename = "pubAddr")]
    pub pub_addr: String,
}

/// The peer's address packet as forwarded back by the bridge.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct PeerInfo {
    #[serde(rename = "peerAddrs")]
    pub peer_addrs: Vec<AddrPair>,
    #[serde(rename = "peerNPlan")]
    pub peer_n_plan: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Vec<String>>,
    #[serde(rename = "tsAddr", skip_serializing_if = "Option::is_none")]
    pub ts_addr: Option<String>,
    /// The local address this party bound for the exchange, echoed back
    /// by the client for the rendezvous that follows. Not on the wire.
    #[serde(skip)]
    pub laddr: String,
}

/// Rendezvous input distilled from a `PeerInfo`: every address the peer
/// might be reachable at, in bridge order, private before public.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnInfo {
    pub laddr: String,
    pub peer_addrs: Vec<String>,
    pub peer_n_plan: usize,
}

impl ConnInfo {
    pub fn from_peer_info(info: &PeerInfo) -> Self {
        let mut addrs = Vec::new();
        for ap in &info.peer_addrs {
            addrs.push(ap.pri_addr.clone());
            if ap.pub_addr != ap.pri_addr {
                addrs.push(ap.pub_addr.clone());
            }
        }
        ConnInfo {
            laddr: info.laddr.clone(),
            peer_addrs: addrs,
            peer_n_plan: info.peer_n_plan,
        }
    }
}

pub async fn send_packet<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "packet too large for framing",
        ));
    }
    w.write_u16(data.len() as u16).await?;
    w.write_all(data).await?;
    w.flush().await
}

pub async fn receive_packet<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_u16().await?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

type ExchangeBody = StreamBody<ReceiverStream<Result<Frame<Bytes>, io::Error>>>;

/// Exchange address packets with a peer of the same channel name through
/// the bridge server.
///
/// The request socket is bound to `local_port` (zero for ephemeral) with
/// the reuse options, because its bound address is advertised as this
/// party's `priAddr` and later re-bound for the rendezvous. The bound
/// address is captured before any byte is sent and echoed back in
/// `PeerInfo::laddr`.
pub async fn exchange(
    bridge_url: &str,
    mut info: SelfInfo,
    local_port: u16,
    use_ipv6: bool,
    cancel: &CancellationToken,
) -> Result<PeerInfo, AnyError> {
    let url: Uri = bridge_url
        .parse()
        .map_err(|e| format!("invalid bridge URL {bridge_url}: {e}"))?;
    let https = url.scheme_str() == Some("https");
    let host = url.host().ok_or("bridge URL has no host")?.to_string();
    let port = url.port_u16().unwrap_or(if https { 443 } else { 80 });

    let network = if use_ipv6 { "tcp6" } else { "tcp4" };
    let raddr = resolve_addr(network, &format!("{host}:{port}")).await?;
    let bind_addr: SocketAddr = if use_ipv6 {
        format!("[::]:{local_port}").parse()?
    } else {
        format!("0.0.0.0:{local_port}").parse()?
    };
    let stream = dial_from(bind_addr, raddr).await?;
    let laddr = stream.local_addr()?;
    info.pri_addr = laddr.to_string();

    let mut req_sender = if https {
        let server_name = ServerName::try_from(host.clone())?;
        let tls = tls_connector().connect(server_name, stream).await?;
        start_http1(tls).await?
    } else {
        start_http1(stream).await?
    };

    // The request body is backed by a channel so it can stay open for the
    // early-close signal while we wait for the bridge to pair us up.
    let (frame_tx, frame_rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(2);
    let body = StreamBody::new(ReceiverStream::new(frame_rx));
    let path = url
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let req = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::HOST, format!("{host}:{port}"))
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(body)?;

    let payload = serde_json::to_vec(&info)?;
    let mut packet = Vec::with_capacity(2 + payload.len());
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(&payload);
    frame_tx
        .try_send(Ok(Frame::data(Bytes::from(packet))))
        .map_err(|_| "failed to communicate with the bridge: request body closed")?;
    debug!("send {}", String::from_utf8_lossy(&payload));

    info!("waiting for peer...");
    let roundtrip = async {
        let resp = req_sender
            .send_request(req)
            .await
            .map_err(|e| format!("failed to communicate with the bridge: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("bridge returned status {}", resp.status()).into());
        }
        let collected = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("failed to communicate with the bridge: {e}"))?;
        Ok::<Bytes, AnyError>(collected.to_bytes())
    };
    let resp_body = tokio::select! {
        r = roundtrip => r?,
        _ = cancel.cancelled() => {
            // notify early close
            let _ = frame_tx.try_send(Ok(Frame::data(Bytes::from_static(&[0xff]))));
            return Err(Cancelled.into());
        }
    };
    drop(frame_tx);

    let mut body_slice: &[u8] = &resp_body;
    let recv = receive_packet(&mut body_slice)
        .await
        .map_err(|e| format!("failed to communicate with the bridge: {e}"))?;
    debug!("recv {}", String::from_utf8_lossy(&recv));
    let mut pinfo: PeerInfo =
        serde_json::from_slice(&recv).map_err(|e| format!("failed to parse msg from bridge: {e}"))?;
    pinfo.laddr = laddr.to_string();
    Ok(pinfo)
}

async fn start_http1<T>(io: T) -> Result<http1::SendRequest<ExchangeBody>, AnyError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| format!("failed to open a connection to the bridge: {e}"))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("bridge connection ended: {e}");
        }
    });
    Ok(sender)
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let conf = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(conf))
}
