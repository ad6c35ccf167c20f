use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::net::TcpListener;

use burrow_common::TunnelError;

/// The requested public port could not be bound
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: SocketAddr,
    #[source]
    pub source: std::io::Error,
}

impl From<BindError> for TunnelError {
    fn from(err: BindError) -> Self {
        TunnelError::Bind {
            port: err.addr.port(),
            source: err.source,
        }
    }
}

/// Binds public listeners for forward requests.
///
/// The OS is the arbiter of port ownership: a port held by any listener in
/// this process, or by anything else on the host, fails to bind.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    bind_ip: IpAddr,
}

impl PortAllocator {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    /// Bind `port` (0 for any free port) and return the listener with the
    /// port it actually bound
    pub async fn bind(&self, port: u16) -> Result<(TcpListener, u16), BindError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BindError { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| BindError { addr, source })?
            .port();
        Ok((listener, bound))
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> PortAllocator {
        PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_port_zero_gets_an_ephemeral_port() {
        let allocator = loopback();
        let (first, first_port) = allocator.bind(0).await.unwrap();
        let (_second, second_port) = allocator.bind(0).await.unwrap();

        assert_ne!(first_port, 0);
        assert_ne!(first_port, second_port);
        assert_eq!(first.local_addr().unwrap().port(), first_port);
    }

    #[tokio::test]
    async fn test_requested_port_is_honoured() {
        let allocator = loopback();
        let (spare, port) = allocator.bind(0).await.unwrap();
        drop(spare);

        let (_listener, bound) = allocator.bind(port).await.unwrap();
        assert_eq!(bound, port);
    }

    #[tokio::test]
    async fn test_port_in_use_is_a_bind_error() {
        let allocator = loopback();
        let (_held, port) = allocator.bind(0).await.unwrap();

        let err = allocator.bind(port).await.unwrap_err();
        assert_eq!(err.addr.port(), port);
        assert_eq!(err.source.kind(), std::io::ErrorKind::AddrInUse);

        let tunnel_err = TunnelError::from(err);
        assert!(matches!(tunnel_err, TunnelError::Bind { port: p, .. } if p == port));
    }
}
