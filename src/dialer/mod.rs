use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::{PeerInfo, SelfInfo};
use crate::config::Config;
use crate::AnyError;

pub mod tailscale;
pub mod tcp_punch;

pub use tailscale::Tailscale;
pub use tcp_punch::TcpPunch;

pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Returned by [`Dialer::init`] when the dialer cannot work in the
/// current environment; the strategy layer silently filters it out.
#[derive(Debug)]
pub struct NotAvailable(pub &'static str);

impl fmt::Display for NotAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "this dialer is not available: {}", self.0)
    }
}

impl Error for NotAvailable {}

/// A way of establishing a byte stream to the peer, with the help of the
/// bridge for information exchange.
///
/// To add a dialer: implement the trait, add it to [`get_dialer`], and
/// extend [`SelfInfo`]/[`PeerInfo`] with whatever fields it needs the
/// bridge to carry.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Configure from `conf` and probe the environment; `NotAvailable`
    /// removes this dialer from the negotiation.
    async fn init(&mut self, conf: &Config) -> Result<(), AnyError>;

    /// Contribute this dialer's fields to the packet sent to the bridge.
    fn set_info(&self, info: &mut SelfInfo);

    /// Establish the sending side of the stream.
    async fn into_sender(
        &self,
        info: &PeerInfo,
        cancel: &CancellationToken,
    ) -> Result<ByteSink, AnyError>;

    /// Establish the receiving side of the stream.
    async fn into_receiver(
        &self,
        info: &PeerInfo,
        cancel: &CancellationToken,
    ) -> Result<ByteSource, AnyError>;
}

pub fn get_dialer(name: &str) -> Option<Box<dyn Dialer>> {
    match name {
        "tcp_punch" => Some(Box::<TcpPunch>::default()),
        "tailscale" => Some(Box::<Tailscale>::default()),
        _ => None,
    }
}
