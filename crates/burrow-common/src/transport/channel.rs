use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot, Semaphore};

use burrow_protocol::{ChannelId, Frame};

use super::connection::Outgoing;

/// Bytes buffered between a channel's user end and its pump tasks
const CHANNEL_BUFFER: usize = 64 * 1024;

/// Largest payload of a single ChannelData frame
const CHANNEL_CHUNK: usize = 16 * 1024;

/// Bytes either side may have in flight on one channel before the peer
/// grants more
pub(crate) const CHANNEL_WINDOW: usize = 256 * 1024;

/// Consumed bytes are granted back once at least this many have piled up
const WINDOW_ADJUST_THRESHOLD: usize = CHANNEL_WINDOW / 2;

/// Connection side of a channel, kept in the connection's channel table.
///
/// Dropping it ends the channel: queued data is still delivered, then the user
/// end sees EOF and a close is sent to the peer.
pub(crate) struct ChannelSlot {
    inbound: mpsc::UnboundedSender<Bytes>,
    send_credit: Arc<Semaphore>,
    recv_window: Arc<AtomicUsize>,
    _closed: oneshot::Sender<()>,
}

/// Pump side of a channel, consumed by [`attach`]
pub(crate) struct ChannelPumps {
    inbound: mpsc::UnboundedReceiver<Bytes>,
    send_credit: Arc<Semaphore>,
    recv_window: Arc<AtomicUsize>,
    closed: oneshot::Receiver<()>,
}

/// A fresh channel with a full window in both directions
pub(crate) fn slot() -> (ChannelSlot, ChannelPumps) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    let send_credit = Arc::new(Semaphore::new(CHANNEL_WINDOW));
    let recv_window = Arc::new(AtomicUsize::new(CHANNEL_WINDOW));

    (
        ChannelSlot {
            inbound: inbound_tx,
            send_credit: send_credit.clone(),
            recv_window: recv_window.clone(),
            _closed: closed_tx,
        },
        ChannelPumps {
            inbound: inbound_rx,
            send_credit,
            recv_window,
            closed: closed_rx,
        },
    )
}

impl ChannelSlot {
    /// Queue data from the peer. Returns false if it exceeds the window the
    /// peer was granted; the data is discarded.
    pub(crate) fn deliver(&self, data: Bytes) -> bool {
        let len = data.len();
        let within = self
            .recv_window
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |window| {
                window.checked_sub(len)
            })
            .is_ok();
        if within {
            // The user end may be gone; its data is simply dropped
            let _ = self.inbound.send(data);
        }
        within
    }

    /// Credit granted by the peer. Returns false if it would exceed the window.
    pub(crate) fn grant(&self, bytes: u32) -> bool {
        let bytes = bytes as usize;
        if self.send_credit.available_permits() + bytes > CHANNEL_WINDOW {
            return false;
        }
        self.send_credit.add_permits(bytes);
        true
    }
}

/// One open channel on a control connection.
///
/// Reads return the peer's bytes and EOF once the peer closes. Shutting down
/// the write side or dropping the stream closes the channel towards the peer.
/// Writes stall while the peer has not consumed the previous window.
#[derive(Debug)]
pub struct ChannelStream {
    id: ChannelId,
    kind: String,
    inner: DuplexStream,
}

impl ChannelStream {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Wire a channel to the connection and hand back its user end.
///
/// The slot matching `pumps` must already be in the connection's channel
/// table so that data arriving right after the open handshake is queued.
pub(crate) fn attach(
    id: ChannelId,
    kind: String,
    outgoing: mpsc::Sender<Outgoing>,
    pumps: ChannelPumps,
) -> ChannelStream {
    let ChannelPumps {
        mut inbound,
        send_credit,
        recv_window,
        mut closed,
    } = pumps;
    let (user_end, pump_end) = tokio::io::duplex(CHANNEL_BUFFER);
    let (mut pump_read, mut pump_write) = tokio::io::split(pump_end);

    // peer -> user
    let grants = outgoing.clone();
    tokio::spawn(async move {
        let mut consumed = 0usize;
        while let Some(data) = inbound.recv().await {
            if pump_write.write_all(&data).await.is_err() {
                break;
            }
            consumed += data.len();
            if consumed >= WINDOW_ADJUST_THRESHOLD {
                recv_window.fetch_add(consumed, Ordering::SeqCst);
                let frame = Frame::ChannelWindowAdjust {
                    channel: id,
                    bytes: consumed as u32,
                };
                if grants.send(Outgoing::Frame(frame)).await.is_err() {
                    break;
                }
                consumed = 0;
            }
        }
        let _ = pump_write.shutdown().await;
    });

    // user -> peer
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHANNEL_CHUNK];
        loop {
            let n = tokio::select! {
                result = pump_read.read(&mut buf) => match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
                _ = &mut closed => break,
            };

            // Hold the chunk until the peer has room for it
            tokio::select! {
                biased;
                permit = send_credit.acquire_many(n as u32) => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                },
                _ = &mut closed => break,
            }

            let frame = Frame::ChannelData {
                channel: id,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            if outgoing.send(Outgoing::Frame(frame)).await.is_err() {
                return;
            }
        }
        let _ = outgoing
            .send(Outgoing::Frame(Frame::ChannelClose { channel: id }))
            .await;
    });

    ChannelStream {
        id,
        kind,
        inner: user_end,
    }
}
