//! Wire protocol for burrow control connections.
//!
//! Two layers live here:
//!
//! - the forwarding messages exchanged inside control requests and channel
//!   opens ([`ForwardRequest`], [`ForwardReply`], [`ForwardedConnection`]),
//!   encoded with SSH-style fixed fields and length-prefixed strings;
//! - the transport [`Frame`] set and its length-delimited [`FrameCodec`].

mod codec;
mod error;
mod forwarding;
mod frame;
pub mod wire;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use forwarding::{ForwardReply, ForwardRequest, ForwardedConnection};
pub use frame::{ChannelId, Frame, RequestId};

/// Control request asking the broker to allocate a public port.
pub const REQUEST_FORWARD: &str = "tcpip-forward";

/// Control request releasing a port previously allocated by [`REQUEST_FORWARD`].
pub const REQUEST_CANCEL_FORWARD: &str = "cancel-tcpip-forward";

/// No-op control request used only to detect transport liveness.
pub const REQUEST_KEEPALIVE: &str = "keepalive@burrow";

/// Channel kind the broker opens for every inbound public connection.
pub const CHANNEL_FORWARDED: &str = "forwarded-tcpip";
