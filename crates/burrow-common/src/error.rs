use thiserror::Error;

use burrow_protocol::ProtocolError;

use crate::transport::TransportError;

/// Failure taxonomy shared by broker and client.
///
/// Only `Transport` is fatal to a control connection. The other variants
/// stay local to the forward request or forwarded connection that raised them.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("failed to reach {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {target}")]
    DialTimeout { target: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TransportError> for TunnelError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AuthRejected(reason) => TunnelError::Auth(reason),
            TransportError::Protocol(e) => TunnelError::Protocol(e),
            other => TunnelError::Transport(other),
        }
    }
}
