use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::bridge::{ConnInfo, PeerInfo, SelfInfo};
use crate::config::Config;
use crate::dialer::{ByteSink, ByteSource, Dialer, NotAvailable};
use crate::encrypt::EncryptedStream;
use crate::rendezvous::rendezvous;
use crate::socket::listen_reusable;
use crate::AnyError;

/// Overlay-network dialer: when both devices share a tailnet, their
/// overlay addresses are directly reachable and the whole bridge-assisted
/// punching machinery reduces to a plain rendezvous on stable addresses.
#[derive(Default)]
pub struct Tailscale {
    laddr: String,
    psk: Vec<u8>,
}

#[async_trait]
impl Dialer for Tailscale {
    fn name(&self) -> &'static str {
        "tailscale"
    }

    async fn init(&mut self, conf: &Config) -> Result<(), AnyError> {
        let output = match Command::new("tailscale").args(["ip", "-4"]).output().await {
            Ok(output) => output,
            Err(e) => {
                debug!("tailscale CLI not found: {e}");
                return Err(NotAvailable("tailscale CLI not found").into());
            }
        };
        if !output.status.success() {
            debug!(
                "tailscale ip failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(NotAvailable("tailscale is not running").into());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(ip) = stdout.lines().next().map(str::trim).filter(|l| !l.is_empty()) else {
            return Err(NotAvailable("no tailscale address").into());
        };

        // verify the address is bindable and let port 0 resolve itself
        let laddr = format!("{ip}:{}", conf.ports()[0]);
        let listener = match listen_reusable(laddr.parse()?) {
            Ok(listener) => listener,
            Err(e) => {
                debug!("listen at tailscale addr {laddr} failed: {e}");
                return Err(NotAvailable("tailscale address is not bindable").into());
            }
        };
        self.laddr = listener.local_addr()?.to_string();
        self.psk = BASE64
            .decode(&conf.psk)
            .map_err(|e| format!("error decoding PSK: {e}"))?;
        debug!("tailscale address {} is available", self.laddr);
        Ok(())
    }

    fn set_info(&self, info: &mut SelfInfo) {
        info.ts_addr = Some(self.laddr.clone());
    }

    async fn into_sender(
        &self,
        info: &PeerInfo,
        cancel: &CancellationToken,
    ) -> Result<ByteSink, AnyError> {
        let conn = rendezvous(&self.overlay_conn_info(info)?, cancel).await?;
        Ok(Box::new(EncryptedStream::new(conn, &self.psk)))
    }

    async fn into_receiver(
        &self,
        info: &PeerInfo,
        cancel: &CancellationToken,
    ) -> Result<ByteSource, AnyError> {
        let conn = rendezvous(&self.overlay_conn_info(info)?, cancel).await?;
        Ok(Box::new(EncryptedStream::new(conn, &self.psk)))
    }
}

impl Tailscale {
    fn overlay_conn_info(&self, info: &PeerInfo) -> Result<ConnInfo, AnyError> {
        let peer = info
            .ts_addr
            .clone()
            .ok_or("peer did not advertise a tailscale address")?;
        Ok(ConnInfo {
            laddr: self.laddr.clone(),
            peer_addrs: vec![peer],
            peer_n_plan: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_conn_info_requires_peer_addr() {
        let dialer = Tailscale {
            laddr: "100.99.98.97:41641".into(),
            psk: vec![0; 32],
        };
        let info = PeerInfo::default();
        assert!(dialer.overlay_conn_info(&info).is_err());

        let info = PeerInfo {
            ts_addr: Some("100.64.0.2:41641".into()),
            ..Default::default()
        };
        let conn = dialer.overlay_conn_info(&info).unwrap();
        assert_eq!(conn.laddr, "100.99.98.97:41641");
        assert_eq!(conn.peer_addrs, vec!["100.64.0.2:41641".to_string()]);
    }
}
