//! Burrow tunnel client library
//!
//! Keeps one control connection to a broker alive and serves every
//! configured tunnel over it.

mod config;
mod orchestrator;
mod remote;

pub use config::{ClientConfig, ConfigError, ResolvedClientConfig, TunnelConfig};
pub use orchestrator::{EstablishedTunnels, TunnelOrchestrator};
pub use remote::{ForwardedStream, RemoteForwards, RemoteListener};
