use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Frame, ProtocolError};

/// Maximum frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length-delimited codec for transport frames
///
/// Wire format:
/// ```text
/// +-----------------+-----+-----------------+
/// | Length (4 bytes | tag | fields          |
/// | big-endian u32) | u8  | (tag specific)  |
/// +-----------------+-----+-----------------+
/// ```
#[derive(Debug, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        let total_len = 4 + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(length).freeze();

        Frame::decode_body(body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Reserve the length prefix, fill it in once the body is known
        let start = dst.len();
        dst.put_u32(0);
        item.encode_body(dst);

        let length = dst.len() - start - 4;
        if length > MAX_FRAME_SIZE {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge(length));
        }

        dst[start..start + 4].copy_from_slice(&(length as u32).to_be_bytes());
        Ok(())
    }
}
