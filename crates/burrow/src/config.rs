//! Client configuration
//!
//! Connection settings are resolved in this order (first found wins):
//! 1. Environment variables (BURROW_SERVER_ADDR, BURROW_SERVER_PORT, BURROW_TOKEN)
//! 2. Config file
//! 3. Default values
//!
//! Tunnels come only from the config file.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use burrow_common::{SecretError, SecretUri};

/// Environment variable prefix
const ENV_PREFIX: &str = "BURROW";

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
    Invalid { field: String, reason: String },

    #[error("failed to resolve {field}: {source}")]
    Secret {
        field: &'static str,
        #[source]
        source: SecretError,
    },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Client configuration (parsed from TOML)
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Broker host name or IP
    #[serde(default)]
    pub server_addr: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Name checked against the broker certificate (defaults to server_addr)
    pub server_name: Option<String>,

    /// Shared token (env://, file://, base64:// or plain)
    pub token: Option<SecretUri>,

    /// CA certificate for the broker; without it any broker certificate is accepted
    #[serde(alias = "ca_cert_path")]
    pub ca_cert: Option<SecretUri>,

    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// One public port mapped to one local service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    pub name: String,

    #[serde(default = "default_local_addr")]
    pub local_addr: String,

    pub local_port: u16,

    /// Public port to request; 0 lets the broker pick
    #[serde(default)]
    pub remote_port: u16,
}

impl TunnelConfig {
    /// `host:port` of the local service
    pub fn local_target(&self) -> String {
        if self.local_addr.contains(':') {
            format!("[{}]:{}", self.local_addr, self.local_port)
        } else {
            format!("{}:{}", self.local_addr, self.local_port)
        }
    }
}

/// Client configuration with secrets resolved and values validated
#[derive(Debug, Clone)]
pub struct ResolvedClientConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub server_name: String,
    pub token: String,
    pub ca_cert_pem: Option<String>,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub dial_timeout: Duration,
    pub connect_timeout: Duration,
    pub tunnels: Vec<TunnelConfig>,
}

impl ResolvedClientConfig {
    /// `host:port` of the broker's control port
    pub fn server_target(&self) -> String {
        if self.server_addr.contains(':') {
            format!("[{}]:{}", self.server_addr, self.server_port)
        } else {
            format!("{}:{}", self.server_addr, self.server_port)
        }
    }
}

fn default_server_port() -> u16 {
    7835
}

fn default_keepalive_interval() -> u64 {
    20
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn non_zero(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Resolve against the process environment
    pub fn resolve(self) -> Result<ResolvedClientConfig, ConfigError> {
        self.resolve_with(get_env)
    }

    /// Resolve with an explicit environment lookup (names without prefix)
    pub fn resolve_with(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedClientConfig, ConfigError> {
        let server_addr = env("SERVER_ADDR").unwrap_or(self.server_addr);
        if server_addr.trim().is_empty() {
            return Err(invalid("server_addr", "must not be empty"));
        }

        let server_port = match env("SERVER_PORT") {
            Some(value) => value
                .parse()
                .map_err(|_| invalid("server_port", format!("'{}' is not a port", value)))?,
            None => self.server_port,
        };
        if server_port == 0 {
            return Err(invalid("server_port", "must not be 0"));
        }

        // An environment token is literal unless it names a scheme
        let token_uri = match env("TOKEN") {
            Some(value) => Some(
                SecretUri::from_override(&value)
                    .map_err(|source| ConfigError::Secret {
                        field: "token",
                        source,
                    })?,
            ),
            None => self.token,
        };
        let token = match token_uri {
            Some(uri) => uri
                .resolve_trimmed()
                .map_err(|source| ConfigError::Secret {
                    field: "token",
                    source,
                })?,
            None => String::new(),
        };

        let ca_cert_pem = match self.ca_cert {
            Some(uri) => Some(uri.resolve_trimmed().map_err(|source| ConfigError::Secret {
                field: "ca_cert",
                source,
            })?),
            None => None,
        };

        if self.tunnels.is_empty() {
            return Err(invalid("tunnels", "at least one [[tunnels]] entry is required"));
        }
        let mut names = HashSet::new();
        for (index, tunnel) in self.tunnels.iter().enumerate() {
            if tunnel.name.trim().is_empty() {
                return Err(invalid(format!("tunnels[{}].name", index), "must not be empty"));
            }
            if !names.insert(tunnel.name.as_str()) {
                return Err(invalid(
                    format!("tunnels[{}].name", index),
                    format!("duplicate tunnel name '{}'", tunnel.name),
                ));
            }
            if tunnel.local_port == 0 {
                return Err(invalid(
                    format!("tunnels[{}].local_port", index),
                    "must not be 0",
                ));
            }
        }

        Ok(ResolvedClientConfig {
            server_name: self.server_name.unwrap_or_else(|| server_addr.clone()),
            server_addr,
            server_port,
            token,
            ca_cert_pem,
            keepalive_interval: non_zero("keepalive_interval_secs", self.keepalive_interval_secs)?,
            reconnect_delay: non_zero("reconnect_delay_secs", self.reconnect_delay_secs)?,
            dial_timeout: non_zero("dial_timeout_secs", self.dial_timeout_secs)?,
            connect_timeout: non_zero("connect_timeout_secs", self.connect_timeout_secs)?,
            tunnels: self.tunnels,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> Result<ResolvedClientConfig, ConfigError> {
        Self::load(path)?.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BASIC: &str = r#"
server_addr = "broker.example.com"
token = "s3cret"

[[tunnels]]
name = "web"
local_port = 9000
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::parse("test.toml", BASIC)
            .unwrap()
            .resolve_with(no_env)
            .unwrap();

        assert_eq!(config.server_target(), "broker.example.com:7835");
        assert_eq!(config.server_name, "broker.example.com");
        assert_eq!(config.token, "s3cret");
        assert!(config.ca_cert_pem.is_none());
        assert_eq!(config.keepalive_interval, Duration::from_secs(20));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));

        let tunnel = &config.tunnels[0];
        assert_eq!(tunnel.local_target(), "127.0.0.1:9000");
        assert_eq!(tunnel.remote_port, 0);
    }

    #[test]
    fn test_tunnels_keep_their_order() {
        let content = r#"
server_addr = "127.0.0.1"

[[tunnels]]
name = "ssh"
local_port = 22
remote_port = 2222

[[tunnels]]
name = "db"
local_addr = "::1"
local_port = 5432
"#;
        let config = ClientConfig::parse("test.toml", content)
            .unwrap()
            .resolve_with(no_env)
            .unwrap();
        let names: Vec<&str> = config.tunnels.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["ssh", "db"]);
        assert_eq!(config.tunnels[0].remote_port, 2222);
        assert_eq!(config.tunnels[1].local_target(), "[::1]:5432");
        assert_eq!(config.token, "");
    }

    #[test]
    fn test_env_overrides_file() {
        let env = |name: &str| match name {
            "SERVER_ADDR" => Some("10.0.0.1".to_string()),
            "SERVER_PORT" => Some("9999".to_string()),
            "TOKEN" => Some("from-env".to_string()),
            _ => None,
        };
        let config = ClientConfig::parse("test.toml", BASIC)
            .unwrap()
            .resolve_with(env)
            .unwrap();
        assert_eq!(config.server_target(), "10.0.0.1:9999");
        assert_eq!(config.token, "from-env");
    }

    #[test]
    fn test_env_token_that_looks_like_a_path_is_literal() {
        let env = |name: &str| match name {
            "TOKEN" => Some("/srv/s3cret.pem".to_string()),
            _ => None,
        };
        let config = ClientConfig::parse("test.toml", BASIC)
            .unwrap()
            .resolve_with(env)
            .unwrap();
        assert_eq!(config.token, "/srv/s3cret.pem");
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            ("server_addr = \"\"\n[[tunnels]]\nname = \"a\"\nlocal_port = 1\n", "server_addr"),
            ("server_addr = \"h\"\n", "tunnels"),
            (
                "server_addr = \"h\"\n[[tunnels]]\nname = \"a\"\nlocal_port = 0\n",
                "tunnels[0].local_port",
            ),
            (
                "server_addr = \"h\"\n[[tunnels]]\nname = \"a\"\nlocal_port = 1\n[[tunnels]]\nname = \"a\"\nlocal_port = 2\n",
                "tunnels[1].name",
            ),
            (
                "server_addr = \"h\"\nkeepalive_interval_secs = 0\n[[tunnels]]\nname = \"a\"\nlocal_port = 1\n",
                "keepalive_interval_secs",
            ),
        ];

        for (content, expected_field) in cases {
            let err = ClientConfig::parse("test.toml", content)
                .unwrap()
                .resolve_with(no_env)
                .unwrap_err();
            match err {
                ConfigError::Invalid { field, .. } => assert_eq!(field, expected_field),
                other => panic!("unexpected error for {:?}: {}", content, other),
            }
        }
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = ClientConfig::parse("test.toml", "server = \"h\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_token_from_file() {
        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(token_file, "file-token").unwrap();

        let mut config_file = tempfile::NamedTempFile::new().unwrap();
        write!(
            config_file,
            "server_addr = \"h\"\ntoken = \"file://{}\"\n[[tunnels]]\nname = \"a\"\nlocal_port = 1\n",
            token_file.path().display()
        )
        .unwrap();

        let config = ClientConfig::load(config_file.path().to_str().unwrap())
            .unwrap()
            .resolve_with(no_env)
            .unwrap();
        assert_eq!(config.token, "file-token");
    }
}
