//! Broker configuration
//!
//! Each setting is resolved in this order (first found wins):
//! 1. Command-line flags
//! 2. Environment variables (BURROW_*)
//! 3. Config file (broker.toml)
//! 4. Default values

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use burrow_common::transport::AccessPolicy;
use burrow_common::{SecretError, SecretUri};

/// Environment variable prefix
const ENV_PREFIX: &str = "BURROW";

pub const DEFAULT_PORT: u16 = 7835;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to resolve {field}: {source}")]
    Secret {
        field: &'static str,
        #[source]
        source: SecretError,
    },

    #[error(
        "no token configured. Set BURROW_TOKEN or token in config, \
         or set allow_anonymous to accept any client"
    )]
    MissingToken,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Broker configuration as written in the TOML file
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Control port clients connect to
    pub port: Option<u16>,

    /// Address the control port binds
    pub listen_addr: Option<String>,

    /// Address forwarded public ports bind
    pub public_addr: Option<String>,

    /// Shared token (env://, file://, base64:// or plain)
    pub token: Option<String>,

    /// Accept clients without checking the token
    pub allow_anonymous: Option<bool>,

    /// Broker certificate PEM (env://, file://, base64://, path or plain)
    #[serde(alias = "cert_path")]
    pub cert: Option<String>,

    /// Broker private key PEM
    #[serde(alias = "key_path")]
    pub key: Option<String>,

    pub handshake_timeout_secs: Option<u64>,
}

/// Values given on the command line
#[derive(Debug, Default, Clone)]
pub struct BrokerOverrides {
    pub port: Option<u16>,
    pub listen_addr: Option<String>,
    pub public_addr: Option<String>,
    pub token: Option<String>,
    pub allow_anonymous: bool,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Broker configuration with secrets resolved
#[derive(Debug)]
pub struct ResolvedBrokerConfig {
    pub listen_addr: SocketAddr,
    pub public_ip: IpAddr,
    pub access: AccessPolicy,
    /// Certificate and key PEM; `None` means generate one at startup
    pub identity: Option<(String, String)>,
    pub handshake_timeout: Duration,
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(field, format!("'{}' is not an IP address", value)))
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, format!("'{}' is not valid", value))),
        None => Ok(None),
    }
}

fn resolve_secret(field: &'static str, source: &str) -> Result<String, ConfigError> {
    let uri: SecretUri = source
        .parse()
        .map_err(|source| ConfigError::Secret { field, source })?;
    uri.resolve_trimmed()
        .map_err(|source| ConfigError::Secret { field, source })
}

impl BrokerConfig {
    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            tracing::debug!("No config file at {}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve against the process environment
    pub fn resolve(self, overrides: &BrokerOverrides) -> Result<ResolvedBrokerConfig, ConfigError> {
        self.resolve_with(overrides, get_env)
    }

    /// Resolve with an explicit environment lookup (names without prefix)
    pub fn resolve_with(
        self,
        overrides: &BrokerOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedBrokerConfig, ConfigError> {
        let port = match overrides.port {
            Some(port) => port,
            None => parse_env(&env, "PORT")?
                .or(self.port)
                .unwrap_or(DEFAULT_PORT),
        };

        let listen_ip = match overrides
            .listen_addr
            .clone()
            .or_else(|| env("LISTEN_ADDR"))
            .or(self.listen_addr)
        {
            Some(addr) => parse_ip("listen_addr", &addr)?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let public_ip = match overrides
            .public_addr
            .clone()
            .or_else(|| env("PUBLIC_ADDR"))
            .or(self.public_addr)
        {
            Some(addr) => parse_ip("public_addr", &addr)?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let allow_anonymous = overrides.allow_anonymous
            || parse_env::<bool>(&env, "ALLOW_ANONYMOUS")?
                .or(self.allow_anonymous)
                .unwrap_or(false);

        // CLI and environment values are literal unless they name a scheme
        let token_uri = match overrides.token.clone().or_else(|| env("TOKEN")) {
            Some(value) => Some(SecretUri::from_override(&value)),
            None => self.token.as_deref().map(str::parse::<SecretUri>),
        }
        .transpose()
        .map_err(|source| ConfigError::Secret {
            field: "token",
            source,
        })?;
        let access = match token_uri {
            Some(uri) => {
                let token = uri
                    .resolve_trimmed()
                    .map_err(|source| ConfigError::Secret {
                        field: "token",
                        source,
                    })?;
                if token.is_empty() {
                    return Err(invalid("token", "must not be empty"));
                }
                AccessPolicy::Token(token)
            }
            None if allow_anonymous => AccessPolicy::Open,
            None => return Err(ConfigError::MissingToken),
        };

        // Certificate: CLI > ENV > ENV_FILE > config
        let cert_source = overrides
            .cert
            .clone()
            .or_else(|| env("CERT"))
            .or_else(|| env("CERT_FILE").map(|f| format!("file://{}", f)))
            .or(self.cert);
        let key_source = overrides
            .key
            .clone()
            .or_else(|| env("KEY"))
            .or_else(|| env("KEY_FILE").map(|f| format!("file://{}", f)))
            .or(self.key);

        let identity = match (cert_source, key_source) {
            (Some(cert), Some(key)) => Some((
                resolve_secret("cert", &cert)?,
                resolve_secret("key", &key)?,
            )),
            (None, None) => None,
            (Some(_), None) => return Err(invalid("key", "cert is set but key is missing")),
            (None, Some(_)) => return Err(invalid("cert", "key is set but cert is missing")),
        };

        let handshake_timeout_secs = parse_env(&env, "HANDSHAKE_TIMEOUT_SECS")?
            .or(self.handshake_timeout_secs)
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS);
        if handshake_timeout_secs == 0 {
            return Err(invalid("handshake_timeout_secs", "must be greater than zero"));
        }

        Ok(ResolvedBrokerConfig {
            listen_addr: SocketAddr::new(listen_ip, port),
            public_ip,
            access,
            identity,
            handshake_timeout: Duration::from_secs(handshake_timeout_secs),
        })
    }

    /// Load config file and resolve with environment and CLI overrides
    pub fn load_and_resolve(
        path: &str,
        overrides: &BrokerOverrides,
    ) -> Result<ResolvedBrokerConfig, ConfigError> {
        Self::load(path)?.resolve(overrides)
    }
}
