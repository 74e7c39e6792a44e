use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use igd::aio::search_gateway;
use igd::{PortMappingProtocol, SearchOptions};
use log::debug;

use crate::AnyError;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
const LEASE_SECS: u32 = 60;

/// Best effort: ask the gateway to map each rendezvous port. The caller
/// logs a failure and proceeds; a transfer never waits on the router
/// beyond the discovery timeout.
pub async fn add_port_mapping(ports: &[u16]) -> Result<(), AnyError> {
    let options = SearchOptions {
        timeout: Some(DISCOVERY_TIMEOUT),
        ..Default::default()
    };
    let gateway = search_gateway(options)
        .await
        .map_err(|e| format!("failed to find a router client: {e}"))?;
    let local_ip = local_ip_towards(*gateway.addr.ip())?;
    debug!("found gateway {} (we are {local_ip})", gateway.addr);

    let mut errs = Vec::new();
    for &port in ports {
        if port == 0 {
            continue; // ephemeral ports cannot be mapped ahead of time
        }
        if let Err(e) = gateway
            .add_port(
                PortMappingProtocol::TCP,
                port,
                SocketAddrV4::new(local_ip, port),
                LEASE_SECS,
                "acp",
            )
            .await
        {
            errs.push(format!("failed to add port mapping for {port}: {e}"));
        }
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs.join("; ").into())
    }
}

// The address the OS would route towards the gateway from; a connected
// UDP socket never sends a packet.
fn local_ip_towards(gateway: Ipv4Addr) -> Result<Ipv4Addr, AnyError> {
    let probe = UdpSocket::bind("0.0.0.0:0")?;
    probe.connect((gateway, 1900))?;
    match probe.local_addr()? {
        std::net::SocketAddr::V4(addr) => Ok(*addr.ip()),
        std::net::SocketAddr::V6(_) => Err("gateway route resolved to IPv6".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ip_towards_loopback() {
        let ip = local_ip_towards(Ipv4Addr::LOCALHOST).unwrap();
        assert!(ip.is_loopback());
    }
}
