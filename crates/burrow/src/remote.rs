use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};

use burrow_common::transport::{ChannelStream, Connection, IncomingChannel, TransportError};
use burrow_protocol::{
    ForwardReply, ForwardRequest, ForwardedConnection, CHANNEL_FORWARDED, REQUEST_CANCEL_FORWARD,
    REQUEST_FORWARD,
};

/// How long an announcement may wait for an in-flight listen to register
const ROUTE_WAIT: Duration = Duration::from_secs(5);

const LISTENER_QUEUE: usize = 64;

/// A connection to a public port, carried on its own channel
#[derive(Debug)]
pub struct ForwardedStream {
    pub stream: ChannelStream,
    pub announcement: ForwardedConnection,
}

impl ForwardedStream {
    /// `addr:port` of the public peer
    pub fn origin(&self) -> String {
        format!(
            "{}:{}",
            self.announcement.origin_addr, self.announcement.origin_port
        )
    }
}

struct Route {
    id: u64,
    connections: mpsc::Sender<ForwardedStream>,
}

struct RemoteInner {
    conn: Connection,
    routes: DashMap<u16, Route>,
    next_route_id: AtomicU64,
    /// Listen requests sent but not yet answered
    pending: AtomicUsize,
    settled: Notify,
}

/// Remote port forwarding over one control connection.
///
/// Routes each `forwarded-tcpip` channel the broker opens to the
/// [`RemoteListener`] that owns its bound port.
#[derive(Clone)]
pub struct RemoteForwards {
    inner: Arc<RemoteInner>,
}

impl RemoteForwards {
    /// Start routing the connection's incoming channels
    pub fn new(conn: Connection, channels: mpsc::Receiver<IncomingChannel>) -> Self {
        let inner = Arc::new(RemoteInner {
            conn,
            routes: DashMap::new(),
            next_route_id: AtomicU64::new(1),
            pending: AtomicUsize::new(0),
            settled: Notify::new(),
        });
        tokio::spawn(dispatch(inner.clone(), channels));
        Self { inner }
    }

    /// Ask the broker to listen on `port` (0 for any) and return a listener
    /// for the connections it forwards
    pub async fn listen(&self, bind_addr: &str, port: u16) -> Result<RemoteListener, TransportError> {
        let inner = &self.inner;
        let _pending = PendingListen::new(inner);

        let payload = ForwardRequest::new(bind_addr, port).encode();
        let reply = inner.conn.send_request(REQUEST_FORWARD, payload).await?;
        let bound = ForwardReply::decode(reply)?.port;

        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
        let id = inner.next_route_id.fetch_add(1, Ordering::Relaxed);
        inner.routes.insert(
            bound,
            Route {
                id,
                connections: tx,
            },
        );

        Ok(RemoteListener {
            bind_addr: bind_addr.to_string(),
            port: bound,
            route_id: id,
            connections: rx,
            remote: self.clone(),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }
}

/// Counts an in-flight listen; wakes waiting announcements when it ends
struct PendingListen<'a> {
    inner: &'a RemoteInner,
}

impl<'a> PendingListen<'a> {
    fn new(inner: &'a RemoteInner) -> Self {
        inner.pending.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for PendingListen<'_> {
    fn drop(&mut self) {
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        self.inner.settled.notify_waiters();
    }
}

/// Connections forwarded from one public port
pub struct RemoteListener {
    bind_addr: String,
    port: u16,
    route_id: u64,
    connections: mpsc::Receiver<ForwardedStream>,
    remote: RemoteForwards,
}

impl RemoteListener {
    /// The public port the broker bound
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    /// Next forwarded connection; `None` once the control connection is gone
    pub async fn accept(&mut self) -> Option<ForwardedStream> {
        self.connections.recv().await
    }

    /// Ask the broker to stop listening on this port.
    ///
    /// Connections already forwarded keep running.
    pub async fn cancel(self) -> Result<(), TransportError> {
        self.remove_route();
        let payload = ForwardRequest::new(self.bind_addr.as_str(), self.port).encode();
        self.remote
            .inner
            .conn
            .send_request(REQUEST_CANCEL_FORWARD, payload)
            .await
            .map(|_| ())
    }

    fn remove_route(&self) {
        let id = self.route_id;
        self.remote
            .inner
            .routes
            .remove_if(&self.port, |_, route| route.id == id);
    }
}

impl Drop for RemoteListener {
    fn drop(&mut self) {
        self.remove_route();
    }
}

async fn dispatch(inner: Arc<RemoteInner>, mut channels: mpsc::Receiver<IncomingChannel>) {
    while let Some(channel) = channels.recv().await {
        tokio::spawn(route_channel(inner.clone(), channel));
    }
    // Connection gone: end every listener's accept loop
    inner.routes.clear();
    tracing::debug!("Channel dispatcher for {} stopped", inner.conn.peer_addr());
}

async fn route_channel(inner: Arc<RemoteInner>, channel: IncomingChannel) {
    if channel.kind() != CHANNEL_FORWARDED {
        tracing::warn!("Broker opened unsupported '{}' channel", channel.kind());
        let _ = channel.reject("unsupported channel type").await;
        return;
    }

    let announcement = match ForwardedConnection::decode(channel.payload()) {
        Ok(announcement) => announcement,
        Err(e) => {
            tracing::warn!("Malformed forwarded-connection announcement: {}", e);
            let _ = channel.reject("malformed announcement").await;
            return;
        }
    };

    let port = announcement.bound_port;
    let Some(connections) = wait_for_route(&inner, port).await else {
        tracing::warn!(
            "No listener for public port {}, refusing connection from {}:{}",
            port,
            announcement.origin_addr,
            announcement.origin_port
        );
        let _ = channel.reject("no listener for port").await;
        return;
    };

    let stream = match channel.accept().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("Failed to accept channel for port {}: {}", port, e);
            return;
        }
    };

    if connections
        .send(ForwardedStream {
            stream,
            announcement,
        })
        .await
        .is_err()
    {
        tracing::debug!("Listener for port {} went away", port);
    }
}

/// Find the listener for `port`, waiting while a listen is still in flight
async fn wait_for_route(inner: &RemoteInner, port: u16) -> Option<mpsc::Sender<ForwardedStream>> {
    let deadline = tokio::time::Instant::now() + ROUTE_WAIT;
    loop {
        let settled = inner.settled.notified();
        tokio::pin!(settled);
        settled.as_mut().enable();

        if let Some(route) = inner.routes.get(&port) {
            return Some(route.connections.clone());
        }
        if inner.pending.load(Ordering::SeqCst) == 0 {
            return None;
        }
        if tokio::time::timeout_at(deadline, settled).await.is_err() {
            return None;
        }
    }
}

impl std::fmt::Debug for RemoteListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteListener")
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use burrow_common::transport::{self, AccessPolicy, Incoming};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// A client connection plus the broker end, answered by hand in each test
    async fn pair() -> (Connection, Incoming, Connection, Incoming) {
        let (client_io, broker_io) = tokio::io::duplex(256 * 1024);
        let addr: SocketAddr = "127.0.0.1:7835".parse().unwrap();
        let broker = tokio::spawn(async move {
            let policy = AccessPolicy::Open;
            transport::accept(broker_io, addr, &policy, TIMEOUT).await
        });
        let (client, client_in) = transport::connect(client_io, addr, "", TIMEOUT)
            .await
            .unwrap();
        let (broker, broker_in) = broker.await.unwrap().unwrap();
        (client, client_in, broker, broker_in)
    }

    fn announcement(port: u16) -> Bytes {
        ForwardedConnection {
            bind_addr: "0.0.0.0".to_string(),
            bound_port: port,
            origin_addr: "203.0.113.7".to_string(),
            origin_port: 50123,
        }
        .encode()
    }

    #[tokio::test]
    async fn test_listen_routes_channels_by_port() {
        let (client, client_in, broker, mut broker_in) = pair().await;
        let remote = RemoteForwards::new(client, client_in.channels);

        let answer = tokio::spawn(async move {
            for port in [41000u16, 41001] {
                let request = broker_in.requests.recv().await.unwrap();
                assert_eq!(request.kind(), REQUEST_FORWARD);
                let forward = ForwardRequest::decode(request.payload()).unwrap();
                assert_eq!(forward.port, 0);
                request
                    .reply_success(ForwardReply { port }.encode())
                    .await
                    .unwrap();
            }
            broker_in
        });

        let mut first = remote.listen("0.0.0.0", 0).await.unwrap();
        let mut second = remote.listen("0.0.0.0", 0).await.unwrap();
        let _broker_in = answer.await.unwrap();
        assert_eq!((first.port(), second.port()), (41000, 41001));

        let mut to_second = broker
            .open_channel(CHANNEL_FORWARDED, announcement(41001))
            .await
            .unwrap();
        let mut to_first = broker
            .open_channel(CHANNEL_FORWARDED, announcement(41000))
            .await
            .unwrap();

        let mut got_second = second.accept().await.unwrap();
        let mut got_first = first.accept().await.unwrap();
        assert_eq!(got_first.origin(), "203.0.113.7:50123");

        to_first.write_all(b"one").await.unwrap();
        to_second.write_all(b"two").await.unwrap();
        let mut buf = [0u8; 3];
        got_first.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        got_second.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn test_announcement_for_unknown_port_is_rejected() {
        let (client, client_in, broker, _broker_in) = pair().await;
        let _remote = RemoteForwards::new(client, client_in.channels);

        let err = broker
            .open_channel(CHANNEL_FORWARDED, announcement(45000))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelRejected { ref reason } if reason == "no listener for port"));
    }

    #[tokio::test]
    async fn test_announcement_waits_for_listen_in_flight() {
        let (client, client_in, broker, mut broker_in) = pair().await;
        let remote = RemoteForwards::new(client, client_in.channels);

        // The broker announces a connection before it replies to the listen
        let answer = tokio::spawn(async move {
            let request = broker_in.requests.recv().await.unwrap();
            let opener = {
                let broker = broker.clone();
                tokio::spawn(async move {
                    broker
                        .open_channel(CHANNEL_FORWARDED, announcement(42000))
                        .await
                })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
            request
                .reply_success(ForwardReply { port: 42000 }.encode())
                .await
                .unwrap();
            (broker_in, opener.await.unwrap())
        });

        let mut listener = remote.listen("0.0.0.0", 42000).await.unwrap();
        let forwarded = tokio::time::timeout(TIMEOUT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.announcement.bound_port, 42000);

        let (_broker_in, opened) = answer.await.unwrap();
        assert!(opened.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_listen_and_cancel() {
        let (client, client_in, _broker, mut broker_in) = pair().await;
        let remote = RemoteForwards::new(client, client_in.channels);

        let answer = tokio::spawn(async move {
            let refused = broker_in.requests.recv().await.unwrap();
            refused.reply_failure().await.unwrap();

            let accepted = broker_in.requests.recv().await.unwrap();
            accepted
                .reply_success(ForwardReply { port: 43000 }.encode())
                .await
                .unwrap();

            let cancel = broker_in.requests.recv().await.unwrap();
            assert_eq!(cancel.kind(), REQUEST_CANCEL_FORWARD);
            assert_eq!(ForwardRequest::decode(cancel.payload()).unwrap().port, 43000);
            cancel.reply_success(Bytes::new()).await.unwrap();
            broker_in
        });

        let err = remote.listen("0.0.0.0", 80).await.unwrap_err();
        assert!(matches!(err, TransportError::RequestRejected { .. }));

        let listener = remote.listen("0.0.0.0", 43000).await.unwrap();
        listener.cancel().await.unwrap();
        assert!(remote.inner.routes.is_empty());
        let _ = answer.await.unwrap();
    }

    #[tokio::test]
    async fn test_listeners_end_when_connection_closes() {
        let (client, client_in, broker, mut broker_in) = pair().await;
        let remote = RemoteForwards::new(client, client_in.channels);

        let answer = tokio::spawn(async move {
            let request = broker_in.requests.recv().await.unwrap();
            request
                .reply_success(ForwardReply { port: 44000 }.encode())
                .await
                .unwrap();
            broker_in
        });
        let mut listener = remote.listen("0.0.0.0", 0).await.unwrap();
        let _broker_in = answer.await.unwrap();

        broker.close();
        let next = tokio::time::timeout(TIMEOUT, listener.accept()).await.unwrap();
        assert!(next.is_none());
    }
}
