//! Burrow broker library
//!
//! Accepts authenticated control connections and exposes each client's
//! forwarded services on public ports. Can be embedded or driven from tests.

mod broker;
mod config;
mod port_allocator;
mod registry;
mod session;

pub use broker::Broker;
pub use config::{BrokerConfig, BrokerOverrides, ConfigError, ResolvedBrokerConfig, DEFAULT_PORT};
pub use port_allocator::{BindError, PortAllocator};
pub use registry::{ForwardListener, ForwardRegistry, RegistryError};
pub use session::{Session, SessionState};
