//! SSH-style wire primitives.
//!
//! All integers are big-endian. Strings and byte blobs are prefixed with
//! their length as a `u32`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Append a length-prefixed UTF-8 string
pub fn put_string(dst: &mut BytesMut, value: &str) {
    put_blob(dst, value.as_bytes());
}

/// Append a length-prefixed byte blob
pub fn put_blob(dst: &mut BytesMut, value: &[u8]) {
    dst.reserve(4 + value.len());
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

/// Append a boolean as a single byte
pub fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

/// Cursor over an encoded payload.
///
/// Every getter names the field it reads so a short payload reports which
/// field was cut off.
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn ensure(&self, field: &'static str, len: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated {
                field,
                needed: len - self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool, ProtocolError> {
        Ok(self.u8(field)? != 0)
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a `u32` that must fit a TCP port
    pub fn port(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        let raw = self.u32(field)?;
        u16::try_from(raw).map_err(|_| ProtocolError::PortOutOfRange(raw))
    }

    pub fn blob(&mut self, field: &'static str) -> Result<Bytes, ProtocolError> {
        let len = self.u32(field)? as usize;
        self.ensure(field, len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.blob(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    /// Everything not consumed yet
    pub fn rest(self) -> Bytes {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "abc");
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_truncated_string_reports_field() {
        // Length claims 10 bytes, only 2 follow
        let mut reader = WireReader::new(Bytes::from_static(&[0, 0, 0, 10, b'h', b'i']));
        match reader.string("bind_addr") {
            Err(ProtocolError::Truncated { field, needed }) => {
                assert_eq!(field, "bind_addr");
                assert_eq!(needed, 8);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_port_out_of_range() {
        let mut reader = WireReader::new(Bytes::from_static(&[0, 1, 0, 0]));
        assert!(matches!(
            reader.port("port"),
            Err(ProtocolError::PortOutOfRange(65536))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = WireReader::new(Bytes::from_static(&[0, 0, 0, 2, 0xff, 0xfe]));
        assert!(matches!(
            reader.string("origin_addr"),
            Err(ProtocolError::InvalidUtf8 { .. })
        ));
    }
}
