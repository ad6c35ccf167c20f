use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use burrow_common::transport::{
    self, Authenticator, Connection, IncomingChannel, IncomingRequest, TransportError,
};
use burrow_protocol::{
    ForwardReply, ForwardRequest, ForwardedConnection, ProtocolError, CHANNEL_FORWARDED,
    REQUEST_CANCEL_FORWARD, REQUEST_FORWARD, REQUEST_KEEPALIVE,
};

use crate::port_allocator::{BindError, PortAllocator};
use crate::registry::{ForwardListener, ForwardRegistry, RegistryError};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
enum ForwardError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct SessionContext {
    id: Uuid,
    conn: Connection,
    registry: ForwardRegistry,
    allocator: PortAllocator,
}

/// Broker side of one control connection, from the auth handshake on.
///
/// Owns the session's forward registry. When the connection ends every
/// listener the session registered is closed before the state reaches
/// `Closed`. A client that fails authentication never becomes `Active`.
pub struct Session {
    id: Uuid,
    allocator: PortAllocator,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn new(allocator: PortAllocator) -> Self {
        let (state, _) = watch::channel(SessionState::Authenticating);
        Self {
            id: Uuid::new_v4(),
            allocator,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Authenticate the client on `stream`, then serve it until the control
    /// connection ends
    pub async fn run<S>(
        self,
        stream: S,
        peer: SocketAddr,
        authenticator: &dyn Authenticator,
        handshake_timeout: Duration,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Session {
            id,
            allocator,
            state,
        } = self;

        let (conn, mut incoming) =
            match transport::accept(stream, peer, authenticator, handshake_timeout).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    set_state(&state, id, SessionState::Closed);
                    return Err(e);
                }
            };
        let ctx = Arc::new(SessionContext {
            id,
            conn,
            registry: ForwardRegistry::new(),
            allocator,
        });

        set_state(&state, id, SessionState::Active);
        tracing::info!("Session {} active for {}", id, peer);

        loop {
            tokio::select! {
                request = incoming.requests.recv() => match request {
                    Some(request) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move { ctx.handle_request(request).await });
                    }
                    None => break,
                },
                channel = incoming.channels.recv() => match channel {
                    Some(channel) => {
                        tokio::spawn(reject_direct_channel(id, peer, channel));
                    }
                    None => break,
                },
            }
        }

        set_state(&state, id, SessionState::Closing);
        ctx.conn.close();

        let listeners = ctx.registry.release_all();
        let released: Vec<u16> = listeners.iter().map(ForwardListener::port).collect();
        for listener in listeners {
            listener.close().await;
        }
        if !released.is_empty() {
            tracing::info!("Session {} released ports {:?}", id, released);
        }

        set_state(&state, id, SessionState::Closed);
        tracing::info!("Session {} with {} closed", id, peer);
        Ok(())
    }
}

fn set_state(state: &watch::Sender<SessionState>, session: Uuid, next: SessionState) {
    let previous = state.send_replace(next);
    tracing::debug!("Session {}: {} -> {}", session, previous, next);
}

async fn reject_direct_channel(session: Uuid, peer: SocketAddr, channel: IncomingChannel) {
    tracing::warn!(
        "Session {} ({}): rejecting '{}' channel opened by client",
        session,
        peer,
        channel.kind()
    );
    let _ = channel.reject("direct channel access not allowed").await;
}

impl SessionContext {
    async fn handle_request(self: Arc<Self>, request: IncomingRequest) {
        let result = match request.kind() {
            REQUEST_FORWARD => self.handle_forward(request).await,
            REQUEST_CANCEL_FORWARD => self.handle_cancel(request).await,
            REQUEST_KEEPALIVE => request.reply_success(Bytes::new()).await,
            other => {
                tracing::warn!(
                    "Session {} ({}): rejecting unknown request '{}'",
                    self.id,
                    self.conn.peer_addr(),
                    other
                );
                request.reply_failure().await
            }
        };
        if let Err(e) = result {
            tracing::debug!("Session {}: failed to send reply: {}", self.id, e);
        }
    }

    async fn handle_forward(
        &self,
        request: IncomingRequest,
    ) -> Result<(), TransportError> {
        let forward = match ForwardRequest::decode(request.payload()) {
            Ok(forward) => forward,
            Err(e) => {
                tracing::warn!(
                    "Session {} ({}): malformed forward request: {}",
                    self.id,
                    self.conn.peer_addr(),
                    e
                );
                return request.reply_failure().await;
            }
        };

        match self.open_forward(&forward).await {
            Ok((port, go)) => {
                let reply = ForwardReply { port }.encode();
                request.reply_success(reply).await?;
                let _ = go.send(());
                tracing::info!(
                    "Session {} ({}): forwarding public port {}",
                    self.id,
                    self.conn.peer_addr(),
                    port
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "Session {} ({}): forward request for {}:{} rejected: {}",
                    self.id,
                    self.conn.peer_addr(),
                    forward.bind_addr,
                    forward.port,
                    e
                );
                request.reply_failure().await
            }
        }
    }

    /// Bind and register a listener. Accepting starts once `go` fires, so no
    /// connection is announced before the client has seen the bound port.
    async fn open_forward(
        &self,
        forward: &ForwardRequest,
    ) -> Result<(u16, oneshot::Sender<()>), ForwardError> {
        let (listener, port) = self.allocator.bind(forward.port).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (go_tx, go_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            self.id,
            self.conn.clone(),
            listener,
            forward.bind_addr.clone(),
            port,
            stop_rx,
            go_rx,
        ));

        self.registry
            .register(port, ForwardListener::new(port, stop_tx, task))?;
        Ok((port, go_tx))
    }

    async fn handle_cancel(
        &self,
        request: IncomingRequest,
    ) -> Result<(), TransportError> {
        let forward = match ForwardRequest::decode(request.payload()) {
            Ok(forward) => forward,
            Err(e) => {
                tracing::warn!("Session {}: malformed cancel request: {}", self.id, e);
                return request.reply_failure().await;
            }
        };

        match self.registry.release(forward.port) {
            Some(listener) => {
                listener.close().await;
                tracing::info!(
                    "Session {} ({}): stopped forwarding public port {}",
                    self.id,
                    self.conn.peer_addr(),
                    forward.port
                );
                request.reply_success(Bytes::new()).await
            }
            None => {
                tracing::warn!(
                    "Session {}: cancel for port {} which it does not own",
                    self.id,
                    forward.port
                );
                request.reply_failure().await
            }
        }
    }
}

async fn accept_loop(
    session: Uuid,
    conn: Connection,
    listener: TcpListener,
    bind_addr: String,
    port: u16,
    mut stop: oneshot::Receiver<()>,
    go: oneshot::Receiver<()>,
) {
    tokio::select! {
        started = go => if started.is_err() {
            return;
        },
        _ = &mut stop => return,
    }

    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, origin)) => {
                    tracing::debug!("Session {}: connection from {} on port {}", session, origin, port);
                    let announcement = ForwardedConnection {
                        bind_addr: bind_addr.clone(),
                        bound_port: port,
                        origin_addr: origin.ip().to_string(),
                        origin_port: origin.port(),
                    };
                    tokio::spawn(forward_connection(session, conn.clone(), stream, announcement));
                }
                Err(e) => {
                    tracing::warn!("Session {}: accept on port {} failed: {}", session, port, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    tracing::debug!("Session {}: listener on port {} closed", session, port);
}

async fn forward_connection(
    session: Uuid,
    conn: Connection,
    stream: TcpStream,
    announcement: ForwardedConnection,
) {
    let origin = format!("{}:{}", announcement.origin_addr, announcement.origin_port);
    let port = announcement.bound_port;

    let channel = match conn
        .open_channel(CHANNEL_FORWARDED, announcement.encode())
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(
                "Session {}: dropping connection from {} on port {}: {}",
                session,
                origin,
                port,
                e
            );
            return;
        }
    };

    let stats = burrow_common::relay(stream, channel).await;
    tracing::debug!(
        "Session {}: connection from {} on port {} finished ({} bytes in, {} bytes out)",
        session,
        origin,
        port,
        stats.a_to_b,
        stats.b_to_a
    );
}
