use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use burrow_protocol::{Frame, FrameCodec};

use super::connection::{Connection, Incoming, Role};
use super::{Authenticator, TransportError};

/// Broker side of the handshake.
///
/// Waits up to `timeout` for the client's Auth frame and checks its token.
/// A rejected client is told why before the stream is closed.
pub async fn accept<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    authenticator: &dyn Authenticator,
    timeout: Duration,
) -> Result<(Connection, Incoming), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut codec = FrameCodec::new();
    let mut read_buf = BytesMut::with_capacity(4096);

    let first = tokio::time::timeout(timeout, read_frame(&mut stream, &mut codec, &mut read_buf))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;

    let token = match first {
        Frame::Auth { token } => token,
        other => {
            let reason = "expected auth".to_string();
            let _ = write_frame(&mut stream, &mut codec, Frame::AuthRejected { reason }).await;
            let _ = stream.shutdown().await;
            return Err(TransportError::UnexpectedFrame(other.name()));
        }
    };

    if !authenticator.authenticate(peer_addr, &token) {
        let reason = "invalid token".to_string();
        let _ = write_frame(
            &mut stream,
            &mut codec,
            Frame::AuthRejected {
                reason: reason.clone(),
            },
        )
        .await;
        let _ = stream.shutdown().await;
        return Err(TransportError::AuthRejected(reason));
    }

    write_frame(&mut stream, &mut codec, Frame::AuthAccepted).await?;

    Ok(Connection::spawn(stream, Role::Broker, peer_addr, read_buf))
}

/// Client side of the handshake
pub async fn connect<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    token: &str,
    timeout: Duration,
) -> Result<(Connection, Incoming), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut codec = FrameCodec::new();
    let mut read_buf = BytesMut::with_capacity(4096);

    write_frame(
        &mut stream,
        &mut codec,
        Frame::Auth {
            token: token.to_string(),
        },
    )
    .await?;

    let reply = tokio::time::timeout(timeout, read_frame(&mut stream, &mut codec, &mut read_buf))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;

    match reply {
        Frame::AuthAccepted => Ok(Connection::spawn(stream, Role::Client, peer_addr, read_buf)),
        Frame::AuthRejected { reason } => Err(TransportError::AuthRejected(reason)),
        other => Err(TransportError::UnexpectedFrame(other.name())),
    }
}

pub(super) async fn read_frame<S>(
    stream: &mut S,
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
) -> Result<Frame, TransportError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = codec.decode(buf)? {
            return Ok(frame);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(TransportError::Closed);
        }
    }
}

pub(super) async fn write_frame<S>(
    stream: &mut S,
    codec: &mut FrameCodec,
    frame: Frame,
) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}
