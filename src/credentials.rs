//! Credential indirection
//!
//! Connection settings such as database passwords may be given inline, as a
//! reference to an environment variable (`env://NAME`) or as a reference to a
//! file (`file:///run/secrets/db-password`). References are resolved every
//! time the value is needed so rotated credentials are picked up without a
//! restart.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

const ENV_PREFIX: &str = "env://";
const FILE_PREFIX: &str = "file://";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("failed to read credential file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Where a credential value comes from
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Literal(String),
    EnvRef(String),
    FileRef(PathBuf),
}

impl CredentialSource {
    /// Read the current value. Never cached.
    pub fn resolve(&self) -> Result<String, CredentialError> {
        match self {
            CredentialSource::Literal(value) => Ok(value.clone()),
            CredentialSource::EnvRef(name) => {
                debug!(variable = %name, "Resolving credential from environment");
                std::env::var(name).map_err(|_| CredentialError::MissingEnv(name.clone()))
            }
            CredentialSource::FileRef(path) => {
                debug!(path = %path.display(), "Resolving credential from file");
                std::fs::read_to_string(path)
                    .map(|contents| contents.trim().to_string())
                    .map_err(|source| CredentialError::File {
                        path: path.display().to_string(),
                        source,
                    })
            }
        }
    }

    /// True for an empty inline value
    pub fn is_empty(&self) -> bool {
        matches!(self, CredentialSource::Literal(value) if value.is_empty())
    }
}

impl Default for CredentialSource {
    fn default() -> Self {
        CredentialSource::Literal(String::new())
    }
}

impl FromStr for CredentialSource {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Ok(if let Some(name) = trimmed.strip_prefix(ENV_PREFIX) {
            CredentialSource::EnvRef(name.to_string())
        } else if let Some(path) = trimmed.strip_prefix(FILE_PREFIX) {
            CredentialSource::FileRef(PathBuf::from(path))
        } else {
            CredentialSource::Literal(value.to_string())
        })
    }
}

impl From<&str> for CredentialSource {
    fn from(value: &str) -> Self {
        match value.parse() {
            Ok(source) => source,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Literal(value) => f.write_str(value),
            CredentialSource::EnvRef(name) => write!(f, "{}{}", ENV_PREFIX, name),
            CredentialSource::FileRef(path) => write!(f, "{}{}", FILE_PREFIX, path.display()),
        }
    }
}

// Inline values may be secrets; keep them out of debug output
impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Literal(_) => f.write_str("Literal(<redacted>)"),
            CredentialSource::EnvRef(name) => f.debug_tuple("EnvRef").field(name).finish(),
            CredentialSource::FileRef(path) => f.debug_tuple("FileRef").field(path).finish(),
        }
    }
}

impl Serialize for CredentialSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CredentialSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(CredentialSource::from(raw.as_str()))
    }
}
