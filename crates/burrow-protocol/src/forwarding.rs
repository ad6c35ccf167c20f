use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{put_string, WireReader};
use crate::ProtocolError;

/// Ask the broker to listen on a public port.
///
/// Wire layout: `string bind_addr || u32 port`. Port 0 means "any free port".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub bind_addr: String,
    pub port: u16,
}

impl ForwardRequest {
    pub fn new(bind_addr: impl Into<String>, port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            port,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.bind_addr.len());
        put_string(&mut buf, &self.bind_addr);
        buf.put_u32(u32::from(self.port));
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        Ok(Self {
            bind_addr: reader.string("bind_addr")?,
            port: reader.port("port")?,
        })
    }
}

/// Successful reply to a [`ForwardRequest`]: `u32 port`.
///
/// A rejected request carries no payload at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardReply {
    pub port: u16,
}

impl ForwardReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(u32::from(self.port));
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        Ok(Self {
            port: reader.port("port")?,
        })
    }
}

/// Announcement sent with every `forwarded-tcpip` channel open.
///
/// Wire layout: `string bind_addr || u32 bound_port || string origin_addr ||
/// u32 origin_port`. The receiver uses `bound_port` to find the tunnel the
/// connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedConnection {
    pub bind_addr: String,
    pub bound_port: u16,
    pub origin_addr: String,
    pub origin_port: u16,
}

impl ForwardedConnection {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(16 + self.bind_addr.len() + self.origin_addr.len());
        put_string(&mut buf, &self.bind_addr);
        buf.put_u32(u32::from(self.bound_port));
        put_string(&mut buf, &self.origin_addr);
        buf.put_u32(u32::from(self.origin_port));
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(payload);
        Ok(Self {
            bind_addr: reader.string("bind_addr")?,
            bound_port: reader.port("bound_port")?,
            origin_addr: reader.string("origin_addr")?,
            origin_port: reader.port("origin_port")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_request_layout() {
        let encoded = ForwardRequest::new("0.0.0.0", 8080).encode();
        assert_eq!(
            &encoded[..],
            &[0, 0, 0, 7, b'0', b'.', b'0', b'.', b'0', b'.', b'0', 0, 0, 0x1f, 0x90]
        );
    }

    #[test]
    fn test_forward_request_any_port() {
        let decoded = ForwardRequest::decode(ForwardRequest::new("", 0).encode()).unwrap();
        assert_eq!(decoded.bind_addr, "");
        assert_eq!(decoded.port, 0);
    }

    #[test]
    fn test_forward_request_missing_port() {
        // Only the address string, no port field
        let payload = Bytes::from_static(&[0, 0, 0, 1, b'x']);
        assert!(matches!(
            ForwardRequest::decode(payload),
            Err(ProtocolError::Truncated { field: "port", .. })
        ));
    }

    #[test]
    fn test_forward_reply_undersized() {
        assert!(ForwardReply::decode(Bytes::from_static(&[0, 0])).is_err());
        assert!(ForwardReply::decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_forward_reply_port() {
        let reply = ForwardReply::decode(Bytes::from_static(&[0, 0, 0xa0, 0x28])).unwrap();
        assert_eq!(reply.port, 41000);
    }

    #[test]
    fn test_announcement_fields() {
        let announcement = ForwardedConnection {
            bind_addr: "0.0.0.0".to_string(),
            bound_port: 41000,
            origin_addr: "203.0.113.9".to_string(),
            origin_port: 52311,
        };
        let decoded = ForwardedConnection::decode(announcement.encode()).unwrap();
        assert_eq!(decoded, announcement);
    }

    #[test]
    fn test_announcement_truncated_origin() {
        let mut full = BytesMut::from(
            &ForwardedConnection {
                bind_addr: "0.0.0.0".to_string(),
                bound_port: 1,
                origin_addr: "10.0.0.1".to_string(),
                origin_port: 2,
            }
            .encode()[..],
        );
        full.truncate(full.len() - 2);
        assert!(matches!(
            ForwardedConnection::decode(full.freeze()),
            Err(ProtocolError::Truncated {
                field: "origin_port",
                ..
            })
        ));
    }
}
