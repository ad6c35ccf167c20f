use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::{Decoder, Encoder};

use burrow_protocol::{ChannelId, Frame, FrameCodec, RequestId};

use super::channel::{self, ChannelSlot, ChannelStream};
use super::TransportError;

const OUTGOING_QUEUE: usize = 256;
const INCOMING_QUEUE: usize = 32;
/// Frames batched into one write before flushing
const WRITE_BATCH_BYTES: usize = 64 * 1024;
/// How long a closing writer may spend sending the TLS close
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Which end of the control connection this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Broker,
}

impl Role {
    fn first_channel_id(self) -> ChannelId {
        match self {
            Role::Client => 1,
            Role::Broker => 2,
        }
    }

    /// Whether `id` belongs to the id space of this role
    fn owns(self, id: ChannelId) -> bool {
        id % 2 == self.first_channel_id() % 2
    }
}

pub(crate) enum Outgoing {
    Frame(Frame),
}

struct Shared {
    role: Role,
    peer_addr: SocketAddr,
    outgoing: mpsc::Sender<Outgoing>,
    shutdown: Notify,
    closed: AtomicBool,
    next_request_id: AtomicU32,
    next_channel_id: AtomicU32,
    pending_requests: DashMap<RequestId, oneshot::Sender<Option<Bytes>>>,
    pending_opens: DashMap<ChannelId, oneshot::Sender<Result<(), String>>>,
    channels: DashMap<ChannelId, ChannelSlot>,
}

impl Shared {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outgoing
            .send(Outgoing::Frame(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn try_send(&self, frame: Frame) {
        let _ = self.outgoing.try_send(Outgoing::Frame(frame));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outgoing.is_closed()
    }

    /// Fail everything waiting on this connection and stop the writer
    fn tear_down(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending_requests.clear();
        self.pending_opens.clear();
        self.channels.clear();
        self.shutdown.notify_one();
    }
}

/// Handle to an established control connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// What the peer initiates: global requests and channel opens.
///
/// Both receivers must be drained; the connection stalls while either is full.
/// Dropping a receiver makes the connection refuse that kind of traffic.
pub struct Incoming {
    pub requests: mpsc::Receiver<IncomingRequest>,
    pub channels: mpsc::Receiver<IncomingChannel>,
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("requests_closed", &self.requests.is_closed())
            .field("channels_closed", &self.channels.is_closed())
            .finish()
    }
}

impl Connection {
    /// Start the reader and writer tasks over an authenticated stream.
    ///
    /// `read_buf` carries any bytes read past the handshake.
    pub(crate) fn spawn<S>(
        stream: S,
        role: Role,
        peer_addr: SocketAddr,
        read_buf: BytesMut,
    ) -> (Connection, Incoming)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (requests_tx, requests_rx) = mpsc::channel(INCOMING_QUEUE);
        let (channels_tx, channels_rx) = mpsc::channel(INCOMING_QUEUE);

        let shared = Arc::new(Shared {
            role,
            peer_addr,
            outgoing: outgoing_tx,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            next_request_id: AtomicU32::new(1),
            next_channel_id: AtomicU32::new(role.first_channel_id()),
            pending_requests: DashMap::new(),
            pending_opens: DashMap::new(),
            channels: DashMap::new(),
        });

        tokio::spawn(write_loop(write_half, outgoing_rx, shared.clone()));
        tokio::spawn(read_loop(
            read_half,
            read_buf,
            shared.clone(),
            requests_tx,
            channels_tx,
        ));

        (
            Connection { shared },
            Incoming {
                requests: requests_rx,
                channels: channels_rx,
            },
        )
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the connection has stopped writing
    pub async fn closed(&self) {
        self.shared.outgoing.closed().await
    }

    /// Close the connection.
    ///
    /// Pending requests and channel opens fail with `Closed` and every open
    /// channel sees EOF.
    pub fn close(&self) {
        self.shared.tear_down();
    }

    /// Send a global request and wait for the peer's reply payload
    pub async fn send_request(&self, kind: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        let shared = &self.shared;
        let id = shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        shared.pending_requests.insert(id, reply_tx);

        if shared.is_closed() {
            shared.pending_requests.remove(&id);
            return Err(TransportError::Closed);
        }

        let frame = Frame::Request {
            id,
            kind: kind.to_string(),
            want_reply: true,
            payload,
        };
        if let Err(e) = shared.send(frame).await {
            shared.pending_requests.remove(&id);
            return Err(e);
        }

        match reply_rx.await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(TransportError::RequestRejected {
                kind: kind.to_string(),
            }),
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// Open a channel of `kind` and wait for the peer to accept it
    pub async fn open_channel(
        &self,
        kind: &str,
        payload: Bytes,
    ) -> Result<ChannelStream, TransportError> {
        let shared = &self.shared;
        let id = shared.next_channel_id.fetch_add(2, Ordering::Relaxed);
        let (slot, pumps) = channel::slot();
        let (reply_tx, reply_rx) = oneshot::channel();

        shared.channels.insert(id, slot);
        shared.pending_opens.insert(id, reply_tx);

        if shared.is_closed() {
            self.forget_channel(id);
            return Err(TransportError::Closed);
        }

        let frame = Frame::ChannelOpen {
            channel: id,
            kind: kind.to_string(),
            payload,
        };
        if let Err(e) = shared.send(frame).await {
            self.forget_channel(id);
            return Err(e);
        }

        match reply_rx.await {
            Ok(Ok(())) => Ok(channel::attach(
                id,
                kind.to_string(),
                shared.outgoing.clone(),
                pumps,
            )),
            Ok(Err(reason)) => {
                shared.channels.remove(&id);
                Err(TransportError::ChannelRejected { reason })
            }
            Err(_) => {
                shared.channels.remove(&id);
                Err(TransportError::Closed)
            }
        }
    }

    fn forget_channel(&self, id: ChannelId) {
        self.shared.pending_opens.remove(&id);
        self.shared.channels.remove(&id);
    }

}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("peer_addr", &self.shared.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A global request from the peer.
///
/// Dropping it unanswered sends a failure reply.
pub struct IncomingRequest {
    id: RequestId,
    kind: String,
    want_reply: bool,
    payload: Bytes,
    shared: Arc<Shared>,
    answered: bool,
}

impl IncomingRequest {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub async fn reply_success(mut self, payload: Bytes) -> Result<(), TransportError> {
        self.answered = true;
        if !self.want_reply {
            return Ok(());
        }
        self.shared
            .send(Frame::RequestSuccess {
                id: self.id,
                payload,
            })
            .await
    }

    pub async fn reply_failure(mut self) -> Result<(), TransportError> {
        self.answered = true;
        if !self.want_reply {
            return Ok(());
        }
        self.shared.send(Frame::RequestFailure { id: self.id }).await
    }
}

impl Drop for IncomingRequest {
    fn drop(&mut self) {
        if self.want_reply && !self.answered {
            self.shared.try_send(Frame::RequestFailure { id: self.id });
        }
    }
}

/// A channel open from the peer.
///
/// Dropping it without accepting rejects the open.
pub struct IncomingChannel {
    id: ChannelId,
    kind: String,
    payload: Bytes,
    shared: Arc<Shared>,
    answered: bool,
}

impl IncomingChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub async fn accept(mut self) -> Result<ChannelStream, TransportError> {
        self.answered = true;
        let (slot, pumps) = channel::slot();
        self.shared.channels.insert(self.id, slot);

        if let Err(e) = self
            .shared
            .send(Frame::ChannelOpenConfirm { channel: self.id })
            .await
        {
            self.shared.channels.remove(&self.id);
            return Err(e);
        }

        Ok(channel::attach(
            self.id,
            self.kind.clone(),
            self.shared.outgoing.clone(),
            pumps,
        ))
    }

    pub async fn reject(mut self, reason: &str) -> Result<(), TransportError> {
        self.answered = true;
        self.shared
            .send(Frame::ChannelOpenFailure {
                channel: self.id,
                reason: reason.to_string(),
            })
            .await
    }
}

impl Drop for IncomingChannel {
    fn drop(&mut self) {
        if !self.answered {
            self.shared.try_send(Frame::ChannelOpenFailure {
                channel: self.id,
                reason: "channel not accepted".to_string(),
            });
        }
    }
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let item = tokio::select! {
            biased;
            _ = shared.shutdown.notified() => break,
            item = outgoing.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        buf.clear();
        let Outgoing::Frame(frame) = item;
        if let Err(e) = codec.encode(frame, &mut buf) {
            tracing::error!("Failed to encode frame for {}: {}", shared.peer_addr, e);
            break;
        }
        while buf.len() < WRITE_BATCH_BYTES {
            let Ok(Outgoing::Frame(frame)) = outgoing.try_recv() else {
                break;
            };
            if let Err(e) = codec.encode(frame, &mut buf) {
                tracing::error!("Failed to encode frame for {}: {}", shared.peer_addr, e);
                break;
            }
        }

        // A peer that stopped reading must not keep a closed connection alive
        let written = tokio::select! {
            biased;
            _ = shared.shutdown.notified() => break,
            result = async {
                writer.write_all(&buf).await?;
                writer.flush().await
            } => result,
        };
        if let Err(e) = written {
            tracing::debug!("Write to {} failed: {}", shared.peer_addr, e);
            break;
        }
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await;
    // Dropping the receiver fails every later send with Closed and wakes the reader
    drop(outgoing);
    tracing::debug!("Writer for {} stopped", shared.peer_addr);
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    mut read_buf: BytesMut,
    shared: Arc<Shared>,
    requests: mpsc::Sender<IncomingRequest>,
    channels: mpsc::Sender<IncomingChannel>,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut codec = FrameCodec::new();

    let reason = 'read: loop {
        loop {
            match codec.decode(&mut read_buf) {
                Ok(Some(frame)) => dispatch(&shared, frame, &requests, &channels).await,
                Ok(None) => break,
                Err(e) => break 'read format!("decode error: {}", e),
            }
        }

        tokio::select! {
            result = reader.read_buf(&mut read_buf) => match result {
                Ok(0) => break "peer closed the connection".to_string(),
                Ok(_) => {}
                Err(e) => break format!("read error: {}", e),
            },
            _ = shared.outgoing.closed() => break "connection closed locally".to_string(),
        }
    };

    tracing::debug!("Reader for {} stopped: {}", shared.peer_addr, reason);
    shared.tear_down();
}

async fn dispatch(
    shared: &Arc<Shared>,
    frame: Frame,
    requests: &mpsc::Sender<IncomingRequest>,
    channels: &mpsc::Sender<IncomingChannel>,
) {
    match frame {
        Frame::Request {
            id,
            kind,
            want_reply,
            payload,
        } => {
            let request = IncomingRequest {
                id,
                kind,
                want_reply,
                payload,
                shared: shared.clone(),
                answered: false,
            };
            // On failure the returned request is dropped, which replies failure
            let _ = requests.send(request).await;
        }
        Frame::RequestSuccess { id, payload } => {
            if let Some((_, reply)) = shared.pending_requests.remove(&id) {
                let _ = reply.send(Some(payload));
            }
        }
        Frame::RequestFailure { id } => {
            if let Some((_, reply)) = shared.pending_requests.remove(&id) {
                let _ = reply.send(None);
            }
        }
        Frame::ChannelOpen {
            channel,
            kind,
            payload,
        } => {
            if shared.role.owns(channel) || shared.channels.contains_key(&channel) {
                tracing::warn!(
                    "Peer {} opened channel {} outside its id space",
                    shared.peer_addr,
                    channel
                );
                let _ = shared
                    .send(Frame::ChannelOpenFailure {
                        channel,
                        reason: "invalid channel id".to_string(),
                    })
                    .await;
                return;
            }
            let incoming = IncomingChannel {
                id: channel,
                kind,
                payload,
                shared: shared.clone(),
                answered: false,
            };
            let _ = channels.send(incoming).await;
        }
        Frame::ChannelOpenConfirm { channel } => {
            if let Some((_, reply)) = shared.pending_opens.remove(&channel) {
                let _ = reply.send(Ok(()));
            }
        }
        Frame::ChannelOpenFailure { channel, reason } => {
            if let Some((_, reply)) = shared.pending_opens.remove(&channel) {
                let _ = reply.send(Err(reason));
            }
        }
        Frame::ChannelData { channel, data } => {
            let within = match shared.channels.get(&channel) {
                Some(slot) => slot.deliver(data),
                None => {
                    tracing::debug!("Data for unknown channel {}", channel);
                    true
                }
            };
            if !within {
                tracing::warn!(
                    "Peer {} overran the window of channel {}, closing it",
                    shared.peer_addr,
                    channel
                );
                shared.channels.remove(&channel);
            }
        }
        Frame::ChannelWindowAdjust { channel, bytes } => {
            let valid = match shared.channels.get(&channel) {
                Some(slot) => slot.grant(bytes),
                None => true,
            };
            if !valid {
                tracing::warn!(
                    "Peer {} granted more than the window of channel {}, closing it",
                    shared.peer_addr,
                    channel
                );
                shared.channels.remove(&channel);
            }
        }
        Frame::ChannelClose { channel } => {
            // Dropping the slot delivers what is queued, then EOF, and answers
            // with our own close
            shared.channels.remove(&channel);
        }
        other => {
            tracing::warn!(
                "Unexpected {} frame from {} after handshake",
                other.name(),
                shared.peer_addr
            );
        }
    }
}
