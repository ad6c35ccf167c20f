use std::net::SocketAddr;

/// Decides whether a connecting client may proceed past the handshake
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, peer: SocketAddr, token: &str) -> bool;
}

/// Shared-token access control
#[derive(Clone)]
pub enum AccessPolicy {
    /// Any token is accepted
    Open,
    /// The presented token must equal this one
    Token(String),
}

impl Authenticator for AccessPolicy {
    fn authenticate(&self, _peer: SocketAddr, token: &str) -> bool {
        match self {
            AccessPolicy::Open => true,
            AccessPolicy::Token(expected) => constant_time_eq(expected.as_bytes(), token.as_bytes()),
        }
    }
}

impl std::fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessPolicy::Open => write!(f, "Open"),
            AccessPolicy::Token(_) => write!(f, "Token(<redacted>)"),
        }
    }
}

// Runtime depends only on the lengths, not on where the inputs differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
