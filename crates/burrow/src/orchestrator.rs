use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_rustls::TlsConnector;

use burrow_common::transport::{self, Connection, IncomingRequest, TransportError};
use burrow_common::{load_client_config, relay, TunnelError};
use burrow_protocol::REQUEST_KEEPALIVE;

use crate::config::{ResolvedClientConfig, TunnelConfig};
use crate::remote::{ForwardedStream, RemoteForwards, RemoteListener};

/// Public port of every tunnel established on the current connection, by name
pub type EstablishedTunnels = BTreeMap<String, u16>;

/// Keeps the control connection to the broker alive and serves every
/// configured tunnel over it.
///
/// On transport loss every tunnel is torn down and the whole connect sequence
/// is retried after a fixed delay, forever.
pub struct TunnelOrchestrator {
    config: Arc<ResolvedClientConfig>,
    tls_connector: TlsConnector,
    server_name: ServerName<'static>,
    established: Arc<watch::Sender<EstablishedTunnels>>,
}

impl TunnelOrchestrator {
    pub fn new(config: ResolvedClientConfig) -> Result<Self, TunnelError> {
        if config.ca_cert_pem.is_none() {
            tracing::warn!("No CA certificate configured, the broker certificate will not be verified");
        }
        let tls_config = load_client_config(config.ca_cert_pem.as_deref())?;

        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| TunnelError::Tls(format!("invalid server name: {}", config.server_name)))?;

        let (established, _) = watch::channel(EstablishedTunnels::new());

        Ok(Self {
            config: Arc::new(config),
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            established: Arc::new(established),
        })
    }

    /// Watch tunnels come up and go down
    pub fn established(&self) -> watch::Receiver<EstablishedTunnels> {
        self.established.subscribe()
    }

    /// Connect, serve, and reconnect until the process ends
    pub async fn run(&self) {
        let target = self.config.server_target();
        loop {
            tracing::info!("Connecting to {}...", target);

            match self.run_connection().await {
                Ok(()) => tracing::info!("Connection to {} closed", target),
                Err(TunnelError::Auth(reason)) => {
                    tracing::error!("Broker {} rejected our credentials: {}", target, reason)
                }
                Err(e) => tracing::error!("Tunnel error: {}", e),
            }

            tracing::info!(
                "Reconnecting in {} seconds...",
                self.config.reconnect_delay.as_secs()
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// Like [`run`](Self::run) but returns once `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = self.run() => {}
            _ = shutdown => tracing::info!("Shutting down tunnels"),
        }
    }

    /// One connection lifetime: connect, serve every tunnel, return on loss
    pub async fn run_connection(&self) -> Result<(), TunnelError> {
        let conn = self.connect().await?;
        tracing::info!("Connected to broker {}", conn.connection().peer_addr());

        let mut tunnels = JoinSet::new();
        for tunnel in &self.config.tunnels {
            tunnels.spawn(run_tunnel(
                conn.clone(),
                tunnel.clone(),
                self.config.clone(),
                self.established.clone(),
            ));
        }

        let control = CloseOnDrop(conn.connection().clone());
        let result = tokio::select! {
            err = keepalive(&control.0, self.config.keepalive_interval) => Err(err),
            _ = control.0.closed() => Err(TunnelError::Transport(TransportError::Closed)),
        };

        drop(control);
        tunnels.shutdown().await;
        self.established.send_modify(|tunnels| tunnels.clear());
        result
    }

    async fn connect(&self) -> Result<RemoteForwards, TunnelError> {
        let target = self.config.server_target();
        let timeout = self.config.connect_timeout;

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| TunnelError::DialTimeout {
                target: target.clone(),
            })?
            .map_err(|source| TunnelError::Dial {
                target: target.clone(),
                source,
            })?;
        let peer_addr = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);

        let tls_stream = tokio::time::timeout(
            timeout,
            self.tls_connector.connect(self.server_name.clone(), stream),
        )
        .await
        .map_err(|_| TunnelError::Transport(TransportError::HandshakeTimeout))?
        .map_err(|e| TunnelError::Tls(format!("handshake with {} failed: {}", target, e)))?;

        let (conn, incoming) =
            transport::connect(tls_stream, peer_addr, &self.config.token, timeout).await?;

        tokio::spawn(refuse_requests(incoming.requests));
        Ok(RemoteForwards::new(conn, incoming.channels))
    }
}

/// Closes the control connection when the serving future ends or is dropped
struct CloseOnDrop(Connection);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Send keepalives until one fails; the error describes the transport loss
async fn keepalive(conn: &Connection, interval: Duration) -> TunnelError {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match tokio::time::timeout(interval, conn.send_request(REQUEST_KEEPALIVE, Bytes::new()))
            .await
        {
            Ok(Ok(_)) => tracing::debug!("Keepalive acknowledged by {}", conn.peer_addr()),
            Ok(Err(e)) => {
                tracing::warn!("Keepalive to {} failed: {}", conn.peer_addr(), e);
                return e.into();
            }
            Err(_) => {
                tracing::warn!("Keepalive to {} timed out", conn.peer_addr());
                return TunnelError::Transport(TransportError::ReplyTimeout(
                    REQUEST_KEEPALIVE.to_string(),
                ));
            }
        }
    }
}

/// The broker has no requests for clients; answer every one with failure
async fn refuse_requests(mut requests: mpsc::Receiver<IncomingRequest>) {
    while let Some(request) = requests.recv().await {
        tracing::debug!("Refusing '{}' request from broker", request.kind());
        let _ = request.reply_failure().await;
    }
}

async fn run_tunnel(
    remote: RemoteForwards,
    tunnel: TunnelConfig,
    config: Arc<ResolvedClientConfig>,
    established: Arc<watch::Sender<EstablishedTunnels>>,
) {
    let listener = loop {
        match remote.listen("0.0.0.0", tunnel.remote_port).await {
            Ok(listener) => break listener,
            Err(TransportError::RequestRejected { .. }) => {
                tracing::warn!(
                    "Tunnel '{}': broker refused remote port {}, retrying in {} seconds",
                    tunnel.name,
                    tunnel.remote_port,
                    config.reconnect_delay.as_secs()
                );
                tokio::time::sleep(config.reconnect_delay).await;
            }
            Err(e) => {
                tracing::debug!("Tunnel '{}': forward request failed: {}", tunnel.name, e);
                return;
            }
        }
    };

    tracing::info!(
        "Tunnel '{}' established: {}:{} -> {}",
        tunnel.name,
        config.server_addr,
        listener.port(),
        tunnel.local_target()
    );
    established.send_modify(|tunnels| {
        tunnels.insert(tunnel.name.clone(), listener.port());
    });

    serve(listener, &tunnel, config.dial_timeout).await;
    tracing::debug!("Tunnel '{}' stopped", tunnel.name);
}

async fn serve(mut listener: RemoteListener, tunnel: &TunnelConfig, dial_timeout: Duration) {
    while let Some(forwarded) = listener.accept().await {
        let name = tunnel.name.clone();
        let target = tunnel.local_target();
        tokio::spawn(forward_to_local(name, target, forwarded, dial_timeout));
    }
}

async fn forward_to_local(
    name: String,
    target: String,
    forwarded: ForwardedStream,
    dial_timeout: Duration,
) {
    let origin = forwarded.origin();
    let local = match dial_local(&target, dial_timeout).await {
        Ok(local) => local,
        Err(e) => {
            // Dropping the channel closes the public connection
            tracing::warn!("Tunnel '{}': dropping connection from {}: {}", name, origin, e);
            return;
        }
    };

    tracing::debug!("Tunnel '{}': relaying {} <-> {}", name, origin, target);
    let stats = relay(forwarded.stream, local).await;
    tracing::debug!(
        "Tunnel '{}': connection from {} finished ({} bytes in, {} bytes out)",
        name,
        origin,
        stats.a_to_b,
        stats.b_to_a
    );
}

async fn dial_local(target: &str, dial_timeout: Duration) -> Result<TcpStream, TunnelError> {
    let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| TunnelError::DialTimeout {
            target: target.to_string(),
        })?
        .map_err(|source| TunnelError::Dial {
            target: target.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
