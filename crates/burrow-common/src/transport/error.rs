use thiserror::Error;

use burrow_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("no reply to '{0}' in time")]
    ReplyTimeout(String),

    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(&'static str),

    #[error("request '{kind}' rejected by peer")]
    RequestRejected { kind: String },

    #[error("channel open rejected: {reason}")]
    ChannelRejected { reason: String },
}
