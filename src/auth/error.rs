// Authentication Error Types
// Failures of the OAuth2/OIDC flow, token verification and header auth

use thiserror::Error;

use crate::session::StoreError;

#[derive(Debug, Error)]
pub enum AuthError {
    // OAuth2 flow
    #[error("Invalid OAuth2 state parameter")]
    InvalidState,

    #[error("Redirect target not allowed: {0}")]
    InvalidRedirect(String),

    #[error("OAuth2 code exchange failed: {0}")]
    CodeExchangeFailed(String),

    #[error("Token response did not include an id_token")]
    MissingIdToken,

    // Token verification
    #[error("JWT error: {0}")]
    JwtError(String),

    #[error("Token is not active")]
    InactiveToken,

    #[error("Invalid credentials")]
    InvalidCredentials,

    // Network/HTTP errors
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),

    #[error("Provider communication timeout")]
    Timeout,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Timeout
        } else {
            AuthError::HttpError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::JsonError(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::JwtError(err.to_string())
    }
}

impl AuthError {
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidState | AuthError::InvalidRedirect(_) => 400,

            AuthError::MissingIdToken
            | AuthError::JwtError(_)
            | AuthError::InactiveToken
            | AuthError::InvalidCredentials => 401,

            AuthError::CodeExchangeFailed(_) | AuthError::HttpError(_) | AuthError::JsonError(_) => {
                502
            }

            AuthError::Timeout => 504,

            AuthError::ConfigError(_) | AuthError::InvalidConfig { .. } => 500,

            AuthError::Store(e) => e.status_code(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::Timeout | AuthError::HttpError(_) => true,
            AuthError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
