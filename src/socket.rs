use std::io;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};

// TCP simultaneous open needs the dialer to originate from the very port
// the peer is dialing to, while a listener is bound to it as well, so
// every rendezvous socket carries SO_REUSEADDR + SO_REUSEPORT.
pub fn reusable_socket(local: SocketAddr) -> io::Result<TcpSocket> {
    let socket = match local {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(local)?;
    Ok(socket)
}

pub fn listen_reusable(local: SocketAddr) -> io::Result<TcpListener> {
    reusable_socket(local)?.listen(1024)
}

/// Dial `peer` from a fresh reusable socket bound to `local`.
pub async fn dial_from(local: SocketAddr, peer: SocketAddr) -> io::Result<TcpStream> {
    reusable_socket(local)?.connect(peer).await
}

/// Resolve a `host:port` string, constrained to the address family named
/// by `network` ("tcp", "tcp4" or "tcp6").
pub async fn resolve_addr(network: &str, addr: &str) -> io::Result<SocketAddr> {
    for candidate in lookup_host(addr).await? {
        let family_ok = match network {
            "tcp4" => candidate.is_ipv4(),
            "tcp6" => candidate.is_ipv6(),
            _ => true,
        };
        if family_ok {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no {network} address found for {addr}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_addr_families() {
        let v4 = resolve_addr("tcp4", "127.0.0.1:9000").await.unwrap();
        assert!(v4.is_ipv4());
        assert_eq!(v4.port(), 9000);

        let v6 = resolve_addr("tcp6", "[::1]:9000").await.unwrap();
        assert!(v6.is_ipv6());

        let any = resolve_addr("tcp", "127.0.0.1:9000").await.unwrap();
        assert_eq!(any, v4);

        assert!(resolve_addr("tcp6", "127.0.0.1:9000").await.is_err());
    }

    #[tokio::test]
    async fn test_listener_and_dialer_share_port() {
        let listener = listen_reusable("127.0.0.1:0".parse().unwrap()).unwrap();
        let laddr = listener.local_addr().unwrap();

        // A dialer bound to the listening port must not fail with AddrInUse.
        let target = listen_reusable("127.0.0.1:0".parse().unwrap()).unwrap();
        let dial = dial_from(laddr, target.local_addr().unwrap());
        let (dialed, accepted) = tokio::join!(dial, target.accept());
        let dialed = dialed.unwrap();
        let (_conn, peer) = accepted.unwrap();
        assert_eq!(dialed.local_addr().unwrap(), laddr);
        assert_eq!(peer, laddr);
    }
}
