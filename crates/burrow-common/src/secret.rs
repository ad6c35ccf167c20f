use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Errors raised while resolving a secret reference
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Invalid secret URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Environment variable '{var}' not set")]
    EnvNotSet { var: String },

    #[error("Failed to read file '{path}': {message}")]
    FileError { path: PathBuf, message: String },

    #[error("base64 error: {0}")]
    Base64(String),
}

/// A reference to a secret value such as the shared token or a PEM blob.
///
/// Supported forms:
/// - `env://VAR_NAME` reads an environment variable
/// - `file:///path/to/file` or a bare path reads a file
/// - `base64://...` decodes inline base64
/// - anything else is taken literally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretUri {
    Plain(String),
    Env { var_name: String },
    File { path: PathBuf },
    Base64 { data: String },
}

impl SecretUri {
    /// Parse a secret given on the command line or in the environment.
    ///
    /// Only explicit `env://`, `file://` and `base64://` references are
    /// followed. Anything else is the secret itself, even if it looks like a
    /// path.
    pub fn from_override(s: &str) -> Result<Self, SecretError> {
        if ["env://", "file://", "base64://"]
            .iter()
            .any(|scheme| s.starts_with(scheme))
        {
            s.parse()
        } else {
            Ok(SecretUri::Plain(s.to_string()))
        }
    }

    /// Resolve the reference to its value
    pub fn resolve(&self) -> Result<String, SecretError> {
        match self {
            SecretUri::Plain(value) => Ok(value.clone()),
            SecretUri::Env { var_name } => {
                std::env::var(var_name).map_err(|_| SecretError::EnvNotSet {
                    var: var_name.clone(),
                })
            }
            SecretUri::File { path } => {
                std::fs::read_to_string(path).map_err(|e| SecretError::FileError {
                    path: path.clone(),
                    message: e.to_string(),
                })
            }
            SecretUri::Base64 { data } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| SecretError::Base64(format!("decode error: {}", e)))?;
                String::from_utf8(bytes)
                    .map_err(|e| SecretError::Base64(format!("invalid UTF-8: {}", e)))
            }
        }
    }

    /// Resolve and strip surrounding whitespace, for tokens read from files
    pub fn resolve_trimmed(&self) -> Result<String, SecretError> {
        self.resolve().map(|value| value.trim().to_string())
    }
}

impl FromStr for SecretUri {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(var_name) = s.strip_prefix("env://") {
            if var_name.is_empty() {
                return Err(invalid_uri(s, "env URI must specify a variable name"));
            }
            Ok(SecretUri::Env {
                var_name: var_name.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(invalid_uri(s, "file URI must specify a path"));
            }
            Ok(SecretUri::File {
                path: PathBuf::from(path),
            })
        } else if let Some(data) = s.strip_prefix("base64://") {
            Ok(SecretUri::Base64 {
                data: data.to_string(),
            })
        } else if looks_like_file_path(s) {
            Ok(SecretUri::File {
                path: PathBuf::from(s),
            })
        } else {
            Ok(SecretUri::Plain(s.to_string()))
        }
    }
}

fn looks_like_file_path(s: &str) -> bool {
    s.starts_with('/')
        || s.starts_with("./")
        || s.starts_with("../")
        || s.ends_with(".pem")
        || s.ends_with(".crt")
        || s.ends_with(".key")
}

fn invalid_uri(uri: &str, reason: &str) -> SecretError {
    SecretError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.to_string(),
    }
}

impl<'de> Deserialize<'de> for SecretUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretUri::from_str(&s).map_err(serde::de::Error::custom)
    }
}
