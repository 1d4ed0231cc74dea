// Authentication Module
// OIDC relying party: provider configuration, endpoints, signed state and token handling

pub mod config;
pub mod endpoint;
pub mod error;
pub mod oauth;
pub mod state;

pub use config::{OidcConfig, OutpostSettings, ProviderConfig, ProxyMode};
pub use endpoint::OidcEndpoints;
pub use error::AuthError;
pub use oauth::{OAuthClient, TokenResponse};
pub use state::{OAuthState, StateSigner};
