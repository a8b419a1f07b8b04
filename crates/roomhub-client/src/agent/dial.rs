//! Destination resolution and dialing via `tokio::net`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{self, TcpStream};
use tracing::debug;

use roomhub_core::{HubError, HubResult};

/// Resolve `host:port` to the first address returned.
pub async fn resolve(destination: &str) -> HubResult<SocketAddr> {
    let mut addrs = net::lookup_host(destination)
        .await
        .map_err(|e| HubError::DestinationResolve(format!("{destination}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| HubError::DestinationResolve(format!("{destination}: no addresses")))?;
    debug!(destination = %destination, addr = %addr, "resolved");
    Ok(addr)
}

/// Open a TCP connection to `addr` within `timeout`.
pub async fn dial(addr: SocketAddr, timeout: Duration) -> HubResult<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| HubError::DestinationDial(format!("{addr}: timed out")))?
        .map_err(|e| HubError::DestinationDial(format!("{addr}: {e}")))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_localhost() {
        let addr = resolve("localhost:80").await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 80);
    }

    #[tokio::test]
    async fn resolve_missing_port_fails() {
        let err = resolve("localhost").await.unwrap_err();
        assert!(matches!(err, HubError::DestinationResolve(_)));
    }

    #[tokio::test]
    async fn resolve_invalid_name_fails() {
        let err = resolve("this-host-does-not-exist.invalid:80")
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::DestinationResolve(_)));
    }

    #[tokio::test]
    async fn dial_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = dial(addr, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, HubError::DestinationDial(_)));
    }

    #[tokio::test]
    async fn dial_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = dial(addr, Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }
}
