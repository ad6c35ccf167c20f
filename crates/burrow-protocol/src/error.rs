use thiserror::Error;

/// Errors raised while decoding wire data
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated payload: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("port {0} is out of range")]
    PortOutOfRange(u32),

    #[error("unknown frame tag: {0:#04x}")]
    UnknownFrame(u8),

    #[error("frame too large: {0} bytes (max {max})", max = crate::MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
