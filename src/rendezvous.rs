use std::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::bridge::ConnInfo;
use crate::socket::{dial_from, listen_reusable, resolve_addr};
use crate::{AnyError, Cancelled};

pub const DIAL_ATTEMPT_INTERVAL: Duration = Duration::from_millis(300);
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_millis(1600);

/// No attempt produced a connection within [`RENDEZVOUS_TIMEOUT`].
/// Recoverable: the caller may retry on its next plan.
#[derive(Debug)]
pub struct RendezvousTimeout;

impl fmt::Display for RendezvousTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rendezvous timed out")
    }
}

impl Error for RendezvousTimeout {}

/// Race a simultaneous open against every known peer address.
///
/// One task accepts on `info.laddr` while one task per peer address dials
/// out from that same port, retrying every [`DIAL_ATTEMPT_INTERVAL`]. The
/// first connected socket wins; every other task sees the cancel
/// broadcast and drops whatever it holds. Exactly one connection is ever
/// returned and none leak on any exit path.
pub async fn rendezvous(
    info: &ConnInfo,
    cancel: &CancellationToken,
) -> Result<TcpStream, AnyError> {
    info!("rendezvous with {}", info.peer_addrs.join(" | "));
    let laddr = resolve_addr("tcp", &info.laddr).await?;
    let listener =
        listen_reusable(laddr).map_err(|e| format!("unable to set up rendezvous: {e}"))?;

    let (win_tx, mut win_rx) = mpsc::channel::<TcpStream>(1);
    let cc = cancel.child_token();

    tokio::spawn(accept(listener, win_tx.clone(), cc.clone()));
    for peer_addr in &info.peer_addrs {
        tokio::spawn(connect(laddr, peer_addr.clone(), win_tx.clone(), cc.clone()));
    }
    drop(win_tx);

    let result: Result<TcpStream, AnyError> = tokio::select! {
        conn = win_rx.recv() => match conn {
            Some(conn) => Ok(conn),
            None => Err("all rendezvous tasks aborted".into()),
        },
        _ = cancel.cancelled() => Err(Cancelled.into()),
        _ = sleep(RENDEZVOUS_TIMEOUT) => Err(RendezvousTimeout.into()),
    };
    // broadcast close: losers drop their sockets, the listener task ends
    cc.cancel();
    result
}

async fn accept(listener: TcpListener, win: mpsc::Sender<TcpStream>, cc: CancellationToken) {
    let conn = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((conn, _addr)) => conn,
            Err(_) => return,
        },
        _ = cc.cancelled() => return,
    };
    debug!("accepted at {:?}", conn.local_addr());
    deliver(conn, win, cc).await;
}

async fn connect(laddr: SocketAddr, raddr: String, win: mpsc::Sender<TcpStream>, cc: CancellationToken) {
    let raddr = match resolve_addr("tcp", &raddr).await {
        Ok(addr) => addr,
        Err(e) => {
            debug!("cannot resolve peer addr {raddr}: {e}");
            return;
        }
    };
    let conn = loop {
        if cc.is_cancelled() {
            return;
        }
        if let Ok(conn) = dial_from(laddr, raddr).await {
            break conn;
        }
        tokio::select! {
            _ = sleep(DIAL_ATTEMPT_INTERVAL) => {}
            _ = cc.cancelled() => return,
        }
    };
    debug!("connected {laddr}->{raddr}");
    deliver(conn, win, cc).await;
}

// Hand the connection to the winner channel, unless the race is already
// over, in which case the connection is dropped (closed) right here.
async fn deliver(conn: TcpStream, win: mpsc::Sender<TcpStream>, cc: CancellationToken) {
    tokio::select! {
        sent = win.send(conn) => { let _ = sent; }
        _ = cc.cancelled() => {}
    }
}
