// Provider Configuration
// One proxy provider as delivered by the control plane

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::AuthError;
use crate::session::SessionOptions;

/// Prefix of every session cookie name
pub const COOKIE_NAME_PREFIX: &str = "authentik_proxy_";

/// How the provider is exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Traffic is proxied to the internal host
    #[default]
    Proxy,
    /// Forward auth for a single application host
    ForwardSingle,
    /// Forward auth for every host below the cookie domain
    ForwardDomain,
}

impl ProxyMode {
    pub fn is_forward(&self) -> bool {
        !matches!(self, ProxyMode::Proxy)
    }
}

/// OIDC endpoints as published by the identity provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub end_session_endpoint: String,
    pub jwks_uri: String,
    pub introspection_endpoint: String,
}

/// Outpost-wide settings shared by all providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutpostSettings {
    /// Name reported in the meta headers
    pub name: String,
    /// Address the outpost uses to reach the identity provider
    pub authentik_host: String,
    /// Address browsers use to reach the identity provider
    pub authentik_host_browser: Option<String>,
    /// Skip TLS verification towards the identity provider
    pub authentik_insecure: bool,
}

impl Default for OutpostSettings {
    fn default() -> Self {
        Self {
            name: "outpost".to_string(),
            authentik_host: String::new(),
            authentik_host_browser: None,
            authentik_insecure: false,
        }
    }
}

/// Configuration of one proxy provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// Isolates this provider's sessions in shared stores
    pub provider_id: String,

    #[serde(default)]
    pub mode: ProxyMode,

    /// Public URL of the application
    pub external_host: String,

    /// Upstream URL, required in proxy mode
    #[serde(default)]
    pub internal_host: String,

    #[serde(default = "default_true")]
    pub internal_host_ssl_validation: bool,

    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    pub cookie_secret: String,

    /// Cookie domain, required in forward_domain mode
    #[serde(default)]
    pub cookie_domain: String,

    #[serde(default)]
    pub oidc: OidcConfig,

    /// Newline separated regular expressions matched against the request URL
    #[serde(default)]
    pub skip_path_regex: String,

    #[serde(default)]
    pub basic_auth_enabled: bool,

    #[serde(default)]
    pub basic_auth_user_attribute: String,

    #[serde(default)]
    pub basic_auth_password_attribute: String,

    /// Accept Bearer/Basic credentials on the inbound Authorization header
    #[serde(default = "default_true")]
    pub intercept_header_auth: bool,

    #[serde(default)]
    pub application_slug: String,

    #[serde(default)]
    pub application_name: String,
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.name.trim().is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "name".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        if self.provider_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "provider_id".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        self.external_url()?;

        if self.mode == ProxyMode::Proxy {
            self.internal_url()?;
        }

        if self.mode == ProxyMode::ForwardDomain && self.cookie_domain.trim().is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "cookie_domain".to_string(),
                reason: "required in forward_domain mode".to_string(),
            });
        }

        if self.client_id.is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "client_id".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        if self.cookie_secret.is_empty() {
            return Err(AuthError::InvalidConfig {
                key: "cookie_secret".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        self.skip_path_patterns()?;

        Ok(())
    }

    pub fn external_url(&self) -> Result<Url, AuthError> {
        parse_host_url("external_host", &self.external_host)
    }

    pub fn internal_url(&self) -> Result<Url, AuthError> {
        parse_host_url("internal_host", &self.internal_host)
    }

    /// Host part of the external URL, including a non-default port
    pub fn external_authority(&self) -> Result<String, AuthError> {
        let url = self.external_url()?;
        let host = url.host_str().unwrap_or_default();
        Ok(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    pub fn skip_path_patterns(&self) -> Result<Vec<Regex>, AuthError> {
        self.skip_path_regex
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                Regex::new(line).map_err(|e| AuthError::InvalidConfig {
                    key: "skip_path_regex".to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// `authentik_proxy_` followed by the first 8 characters of the client id
    pub fn cookie_name(&self) -> String {
        let suffix: String = self.client_id.chars().take(8).collect();
        format!("{}{}", COOKIE_NAME_PREFIX, suffix)
    }

    pub fn session_options(&self) -> SessionOptions {
        let secure = self.external_host.starts_with("https://");
        let domain = (self.mode == ProxyMode::ForwardDomain && !self.cookie_domain.is_empty())
            .then(|| self.cookie_domain.clone());
        SessionOptions {
            domain,
            secure,
            ..SessionOptions::default()
        }
    }

    pub fn callback_url(&self) -> String {
        format!(
            "{}/outpost.goauthentik.io/callback",
            self.external_host.trim_end_matches('/')
        )
    }
}

fn parse_host_url(key: &str, value: &str) -> Result<Url, AuthError> {
    let url = Url::parse(value).map_err(|e| AuthError::InvalidConfig {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(AuthError::InvalidConfig {
            key: key.to_string(),
            reason: "must contain a host".to_string(),
        });
    }
    Ok(url)
}
