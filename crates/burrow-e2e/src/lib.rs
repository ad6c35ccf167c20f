//! End-to-end test infrastructure for Burrow
//!
//! Runs a real broker and real clients over loopback TLS, with mock local
//! services behind the tunnels and a severable link for reconnect testing.

pub mod certificates;
pub mod harness;
pub mod link;
pub mod mock_tcp_service;

pub use certificates::TestCertificates;
pub use harness::{
    free_port, tunnel, tunnel_on, wait_for_tunnel, wait_for_tunnels_down, TestBroker, TestClient,
    TEST_TOKEN,
};
pub use link::SeverableLink;
pub use mock_tcp_service::{MockTcpService, RecordedTcpConnection, TcpServiceMode};
