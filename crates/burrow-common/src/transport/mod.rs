//! Authenticated, multiplexed control connection.
//!
//! One TLS stream carries the handshake, global requests with replies, and
//! any number of byte channels. Each side owns half of the channel id space
//! (client odd, broker even) so both may open channels without coordination.

mod auth;
mod channel;
mod connection;
mod error;
mod handshake;

pub use auth::{AccessPolicy, Authenticator};
pub use channel::ChannelStream;
pub use connection::{Connection, Incoming, IncomingChannel, IncomingRequest, Role};
pub use error::TransportError;
pub use handshake::{accept, connect};

#[cfg(test)]
mod tests;
