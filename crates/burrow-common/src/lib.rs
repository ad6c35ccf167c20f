//! Code shared by the burrow broker and client.

mod error;
mod identity;
mod relay;
mod secret;
mod tls;
pub mod transport;

pub use error::TunnelError;
pub use identity::BrokerIdentity;
pub use relay::{relay, RelayEnd, RelayStats};
pub use secret::{SecretError, SecretUri};
pub use tls::{
    load_certs_from_pem, load_client_config, load_private_key_from_pem, load_server_config,
};
