use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{put_blob, put_bool, put_string, WireReader};
use crate::ProtocolError;

pub type RequestId = u32;
pub type ChannelId = u32;

const TAG_AUTH: u8 = 0x01;
const TAG_AUTH_ACCEPTED: u8 = 0x02;
const TAG_AUTH_REJECTED: u8 = 0x03;
const TAG_REQUEST: u8 = 0x10;
const TAG_REQUEST_SUCCESS: u8 = 0x11;
const TAG_REQUEST_FAILURE: u8 = 0x12;
const TAG_CHANNEL_OPEN: u8 = 0x20;
const TAG_CHANNEL_OPEN_CONFIRM: u8 = 0x21;
const TAG_CHANNEL_OPEN_FAILURE: u8 = 0x22;
const TAG_CHANNEL_DATA: u8 = 0x23;
const TAG_CHANNEL_CLOSE: u8 = 0x24;
const TAG_CHANNEL_WINDOW_ADJUST: u8 = 0x25;

/// A single unit on the control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// First frame sent by the client
    Auth { token: String },

    AuthAccepted,

    AuthRejected { reason: String },

    /// Control request (forward, keepalive, ...)
    Request {
        id: RequestId,
        kind: String,
        want_reply: bool,
        payload: Bytes,
    },

    RequestSuccess { id: RequestId, payload: Bytes },

    RequestFailure { id: RequestId },

    /// Ask the peer to accept a new data channel
    ChannelOpen {
        channel: ChannelId,
        kind: String,
        payload: Bytes,
    },

    ChannelOpenConfirm { channel: ChannelId },

    ChannelOpenFailure { channel: ChannelId, reason: String },

    ChannelData { channel: ChannelId, data: Bytes },

    /// The channel is finished in both directions; answered with a close
    ChannelClose { channel: ChannelId },

    /// The receiver consumed `bytes` more; the sender may send that much more
    ChannelWindowAdjust { channel: ChannelId, bytes: u32 },
}

impl Frame {
    /// Append the frame body (tag and fields, no length prefix)
    pub fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Frame::Auth { token } => {
                dst.put_u8(TAG_AUTH);
                put_string(dst, token);
            }
            Frame::AuthAccepted => dst.put_u8(TAG_AUTH_ACCEPTED),
            Frame::AuthRejected { reason } => {
                dst.put_u8(TAG_AUTH_REJECTED);
                put_string(dst, reason);
            }
            Frame::Request {
                id,
                kind,
                want_reply,
                payload,
            } => {
                dst.put_u8(TAG_REQUEST);
                dst.put_u32(*id);
                put_string(dst, kind);
                put_bool(dst, *want_reply);
                put_blob(dst, payload);
            }
            Frame::RequestSuccess { id, payload } => {
                dst.put_u8(TAG_REQUEST_SUCCESS);
                dst.put_u32(*id);
                put_blob(dst, payload);
            }
            Frame::RequestFailure { id } => {
                dst.put_u8(TAG_REQUEST_FAILURE);
                dst.put_u32(*id);
            }
            Frame::ChannelOpen {
                channel,
                kind,
                payload,
            } => {
                dst.put_u8(TAG_CHANNEL_OPEN);
                dst.put_u32(*channel);
                put_string(dst, kind);
                put_blob(dst, payload);
            }
            Frame::ChannelOpenConfirm { channel } => {
                dst.put_u8(TAG_CHANNEL_OPEN_CONFIRM);
                dst.put_u32(*channel);
            }
            Frame::ChannelOpenFailure { channel, reason } => {
                dst.put_u8(TAG_CHANNEL_OPEN_FAILURE);
                dst.put_u32(*channel);
                put_string(dst, reason);
            }
            Frame::ChannelData { channel, data } => {
                dst.put_u8(TAG_CHANNEL_DATA);
                dst.put_u32(*channel);
                put_blob(dst, data);
            }
            Frame::ChannelClose { channel } => {
                dst.put_u8(TAG_CHANNEL_CLOSE);
                dst.put_u32(*channel);
            }
            Frame::ChannelWindowAdjust { channel, bytes } => {
                dst.put_u8(TAG_CHANNEL_WINDOW_ADJUST);
                dst.put_u32(*channel);
                dst.put_u32(*bytes);
            }
        }
    }

    /// Parse a frame body produced by [`Frame::encode_body`]
    pub fn decode_body(body: Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body);
        let frame = match r.u8("tag")? {
            TAG_AUTH => Frame::Auth {
                token: r.string("token")?,
            },
            TAG_AUTH_ACCEPTED => Frame::AuthAccepted,
            TAG_AUTH_REJECTED => Frame::AuthRejected {
                reason: r.string("reason")?,
            },
            TAG_REQUEST => Frame::Request {
                id: r.u32("request_id")?,
                kind: r.string("request_kind")?,
                want_reply: r.bool("want_reply")?,
                payload: r.blob("request_payload")?,
            },
            TAG_REQUEST_SUCCESS => Frame::RequestSuccess {
                id: r.u32("request_id")?,
                payload: r.blob("reply_payload")?,
            },
            TAG_REQUEST_FAILURE => Frame::RequestFailure {
                id: r.u32("request_id")?,
            },
            TAG_CHANNEL_OPEN => Frame::ChannelOpen {
                channel: r.u32("channel_id")?,
                kind: r.string("channel_kind")?,
                payload: r.blob("channel_payload")?,
            },
            TAG_CHANNEL_OPEN_CONFIRM => Frame::ChannelOpenConfirm {
                channel: r.u32("channel_id")?,
            },
            TAG_CHANNEL_OPEN_FAILURE => Frame::ChannelOpenFailure {
                channel: r.u32("channel_id")?,
                reason: r.string("reason")?,
            },
            TAG_CHANNEL_DATA => Frame::ChannelData {
                channel: r.u32("channel_id")?,
                data: r.blob("data")?,
            },
            TAG_CHANNEL_CLOSE => Frame::ChannelClose {
                channel: r.u32("channel_id")?,
            },
            TAG_CHANNEL_WINDOW_ADJUST => Frame::ChannelWindowAdjust {
                channel: r.u32("channel_id")?,
                bytes: r.u32("window_bytes")?,
            },
            other => return Err(ProtocolError::UnknownFrame(other)),
        };
        Ok(frame)
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::AuthAccepted => "auth-accepted",
            Frame::AuthRejected { .. } => "auth-rejected",
            Frame::Request { .. } => "request",
            Frame::RequestSuccess { .. } => "request-success",
            Frame::RequestFailure { .. } => "request-failure",
            Frame::ChannelOpen { .. } => "channel-open",
            Frame::ChannelOpenConfirm { .. } => "channel-open-confirm",
            Frame::ChannelOpenFailure { .. } => "channel-open-failure",
            Frame::ChannelData { .. } => "channel-data",
            Frame::ChannelClose { .. } => "channel-close",
            Frame::ChannelWindowAdjust { .. } => "channel-window-adjust",
        }
    }
}
