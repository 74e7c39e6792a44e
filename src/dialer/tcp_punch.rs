use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::info;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::bridge::{exchange, ConnInfo, PeerInfo, SelfInfo};
use crate::config::Config;
use crate::dialer::{ByteSink, ByteSource, Dialer};
use crate::encrypt::EncryptedStream;
use crate::rendezvous::{rendezvous, RendezvousTimeout};
use crate::{upnp, AnyError};

/// Direct connection by TCP simultaneous open, with the bridge providing
/// fresh NAT translations for every port plan.
#[derive(Default)]
pub struct TcpPunch {
    bridge_url: String,
    chan_name: String,
    psk: Vec<u8>,
    use_ipv6: bool,
    ports: Vec<u16>,
    upnp: bool,
}

#[async_trait]
impl Dialer for TcpPunch {
    fn name(&self) -> &'static str {
        "tcp_punch"
    }

    async fn init(&mut self, conf: &Config) -> Result<(), AnyError> {
        self.bridge_url = format!("{}/v2/exchange", conf.server());
        self.chan_name = conf.id.clone();
        self.psk = BASE64
            .decode(&conf.psk)
            .map_err(|e| format!("error decoding PSK: {e}"))?;
        self.use_ipv6 = conf.use_ipv6();
        self.ports = conf.ports();
        self.upnp = conf.upnp();
        Ok(())
    }

    fn set_info(&self, info: &mut SelfInfo) {
        info.n_plan = Some(self.ports.len());
    }

    async fn into_sender(
        &self,
        info: &PeerInfo,
        cancel: &CancellationToken,
    ) -> Result<ByteSink, AnyError> {
        let conn = self.hole_punching(info, true, cancel).await?;
        Ok(Box::new(EncryptedStream::new(conn, &self.psk)))
    }

    async fn into_receiver(
        &self,
        info: &PeerInfo,
        cancel: &CancellationToken,
    ) -> Result<ByteSource, AnyError> {
        let conn = self.hole_punching(info, false, cancel).await?;
        Ok(Box::new(EncryptedStream::new(conn, &self.psk)))
    }
}

impl TcpPunch {
    /// Work through the nA x nB port plans until one rendezvous sticks.
    ///
    /// The strategy negotiation already performed an exchange on
    /// `ports[0]`, whose result is `info` - that exchange is attempt 0 of
    /// the cross-product, so the loop resumes from the second plan. Every
    /// later plan re-exchanges with the bridge to pick up a fresh public
    /// port translation before the rendezvous.
    async fn hole_punching(
        &self,
        info: &PeerInfo,
        is_sender: bool,
        cancel: &CancellationToken,
    ) -> Result<TcpStream, AnyError> {
        if self.upnp {
            if let Err(e) = upnp::add_port_mapping(&self.ports).await {
                info!("failed to add port mapping: {e}");
            }
        }

        match rendezvous(&ConnInfo::from_peer_info(info), cancel).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.downcast_ref::<RendezvousTimeout>().is_some() => {
                info!("rendezvous timeout on the first plan");
            }
            Err(e) => return Err(e),
        }

        let n_plan = self.ports.len();
        let peer_n_plan = info.peer_n_plan.max(1);
        // row-major from the sender's perspective, column-major from the
        // receiver's: both walk the same global order
        let (rows, cols) = if is_sender {
            (n_plan, peer_n_plan)
        } else {
            (peer_n_plan, n_plan)
        };
        let mut plan_ports = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                let q = if is_sender { i } else { j };
                plan_ports.push(self.ports[q]);
            }
        }

        for &port in &plan_ports[1..] {
            let sinfo = SelfInfo {
                chan_name: self.chan_name.clone(),
                n_plan: Some(n_plan),
                ..Default::default()
            };
            let pinfo = exchange(&self.bridge_url, sinfo, port, self.use_ipv6, cancel).await?;
            match rendezvous(&ConnInfo::from_peer_info(&pinfo), cancel).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.downcast_ref::<RendezvousTimeout>().is_some() => {
                    info!("rendezvous timeout on plan port {port}");
                }
                Err(e) => return Err(e),
            }
        }
        Err("all rendezvous attempts failed".into())
    }
}
