use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use burrow_common::transport::{Authenticator, TransportError};
use burrow_common::TunnelError;

use crate::port_allocator::PortAllocator;
use crate::session::Session;

/// Accepts control connections and runs one [`Session`] per client
pub struct Broker {
    tls_acceptor: TlsAcceptor,
    authenticator: Arc<dyn Authenticator>,
    allocator: PortAllocator,
    handshake_timeout: Duration,
}

impl Broker {
    pub fn new(
        tls_config: Arc<rustls::ServerConfig>,
        authenticator: Arc<dyn Authenticator>,
        allocator: PortAllocator,
        handshake_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            tls_acceptor: TlsAcceptor::from(tls_config),
            authenticator,
            allocator,
            handshake_timeout,
        })
    }

    /// Bind the control port and serve until the listener fails
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<(), TunnelError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind {
                port: addr.port(),
                source,
            })?;
        self.run_with_listener(listener).await
    }

    /// Serve control connections on an already bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), TunnelError> {
        tracing::info!("Broker listening on {}", listener.local_addr()?);
        tracing::info!("Forwarded ports bind on {}", self.allocator.bind_ip());

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept control connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let this = self.clone();

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    match e {
                        TunnelError::Auth(reason) => {
                            tracing::warn!("Rejected client {}: {}", peer_addr, reason)
                        }
                        e => tracing::error!("Connection error from {}: {}", peer_addr, e),
                    }
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), TunnelError> {
        tracing::debug!("New connection from {}", peer_addr);
        let _ = stream.set_nodelay(true);

        let tls_stream = tokio::time::timeout(self.handshake_timeout, self.tls_acceptor.accept(stream))
            .await
            .map_err(|_| TunnelError::Transport(TransportError::HandshakeTimeout))?
            .map_err(|e| TunnelError::Tls(format!("handshake with {} failed: {}", peer_addr, e)))?;
        tracing::debug!("TLS handshake complete with {}", peer_addr);

        let session = Session::new(self.allocator);
        tracing::debug!("Session {} started for {}", session.id(), peer_addr);
        session
            .run(
                tls_stream,
                peer_addr,
                self.authenticator.as_ref(),
                self.handshake_timeout,
            )
            .await?;
        Ok(())
    }
}
