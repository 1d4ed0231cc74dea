// Outpost Configuration
// Loaded from a TOML or YAML file with OUTPOST_ prefixed environment overrides

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::auth::{OutpostSettings, ProviderConfig};
use crate::session::StorageConfig;

/// Prefix of environment overrides, nested with `__`
pub const ENV_PREFIX: &str = "OUTPOST_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid configuration for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9000".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|e| ConfigError::Invalid {
            key: "server.listen".to_string(),
            reason: format!("{}", e),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutpostConfig {
    pub server: ServerConfig,
    pub outpost: OutpostSettings,
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub providers: Vec<ProviderConfig>,
}

impl OutpostConfig {
    /// Load defaults, then `path` (if any), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(OutpostConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Load(format!(
                    "configuration file {} not found",
                    path.display()
                )));
            }
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        let config: OutpostConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.listen_addr()?;

        self.storage.validate().map_err(|e| ConfigError::Invalid {
            key: "storage".to_string(),
            reason: e.to_string(),
        })?;

        let mut hosts = HashSet::new();
        for (index, provider) in self.providers.iter().enumerate() {
            provider.validate().map_err(|e| ConfigError::Invalid {
                key: format!("providers[{}]", index),
                reason: e.to_string(),
            })?;
            let host = provider
                .external_authority()
                .map_err(|e| ConfigError::Invalid {
                    key: format!("providers[{}].external_host", index),
                    reason: e.to_string(),
                })?
                .to_ascii_lowercase();
            if !hosts.insert(host.clone()) {
                return Err(ConfigError::Invalid {
                    key: format!("providers[{}].external_host", index),
                    reason: format!("{} is served by another provider", host),
                });
            }
        }
        Ok(())
    }
}
