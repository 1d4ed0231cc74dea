use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::auth::AuthError;
use crate::session::StoreError;

/// Error classification for responses sent to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,

    // Server errors (5xx)
    InternalServerError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,

    // Outpost specific errors
    ConfigurationError,
    SessionStoreError,
    IdentityProviderError,
    UnknownHost,
}

impl ErrorCode {
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound | ErrorCode::UnknownHost => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::InternalServerError
            | ErrorCode::ConfigurationError
            | ErrorCode::SessionStoreError => 500,
            ErrorCode::BadGateway | ErrorCode::IdentityProviderError => 502,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::GatewayTimeout => 504,
        }
    }
}

/// Structured error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
    pub status: u16,
}

/// Details of an error occurrence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: String,
    pub timestamp: String,
    pub path: String,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// Builder for creating error responses
pub struct ErrorResponseBuilder {
    code: ErrorCode,
    message: String,
    status: Option<u16>,
    request_id: String,
    path: String,
    context: HashMap<String, serde_json::Value>,
}

impl ErrorResponseBuilder {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            request_id: "unknown".to_string(),
            path: "/".to_string(),
            context: HashMap::new(),
        }
    }

    /// Override the status derived from the code
    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ErrorResponse {
        ErrorResponse {
            status: self.status.unwrap_or_else(|| self.code.status()),
            error: ErrorDetails {
                code: self.code,
                message: self.message,
                request_id: self.request_id,
                timestamp: chrono::Utc::now().to_rfc3339(),
                path: self.path,
                context: self.context,
            },
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self)).into_response()
    }
}

/// Client-safe message; details stay in the logs
fn public_message(status: u16) -> &'static str {
    match status {
        400 => "Bad request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not found",
        409 => "Conflict",
        502 => "Identity provider unavailable",
        503 => "Service unavailable",
        504 => "Upstream timeout",
        _ => "Internal server error",
    }
}

impl From<&StoreError> for ErrorCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Configuration(_) => ErrorCode::ConfigurationError,
            StoreError::Timeout(_) => ErrorCode::GatewayTimeout,
            StoreError::Transport(_) | StoreError::Authentication(_) => {
                ErrorCode::ServiceUnavailable
            }
            StoreError::CleanupAlreadyRunning => ErrorCode::Conflict,
            _ => ErrorCode::SessionStoreError,
        }
    }
}

impl From<&AuthError> for ErrorCode {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::InvalidState | AuthError::InvalidRedirect(_) => ErrorCode::BadRequest,
            AuthError::MissingIdToken
            | AuthError::JwtError(_)
            | AuthError::InactiveToken
            | AuthError::InvalidCredentials => ErrorCode::Unauthorized,
            AuthError::CodeExchangeFailed(_) | AuthError::HttpError(_) | AuthError::JsonError(_) => {
                ErrorCode::IdentityProviderError
            }
            AuthError::Timeout => ErrorCode::GatewayTimeout,
            AuthError::ConfigError(_) | AuthError::InvalidConfig { .. } => {
                ErrorCode::ConfigurationError
            }
            AuthError::Store(e) => ErrorCode::from(e),
        }
    }
}

/// Helper functions for common error types
pub mod errors {
    use super::*;

    pub fn from_auth(err: &AuthError, path: &str, request_id: &str) -> ErrorResponse {
        let status = err.status_code();
        ErrorResponseBuilder::new(ErrorCode::from(err), public_message(status))
            .status(status)
            .path(path)
            .request_id(request_id)
            .build()
    }

    pub fn unknown_host(host: &str, path: &str, request_id: &str) -> ErrorResponse {
        ErrorResponseBuilder::new(ErrorCode::UnknownHost, "No provider for this host")
            .context("host", host)
            .path(path)
            .request_id(request_id)
            .build()
    }

    pub fn not_found(path: &str, request_id: &str) -> ErrorResponse {
        ErrorResponseBuilder::new(ErrorCode::NotFound, "Resource not found")
            .path(path)
            .request_id(request_id)
            .build()
    }

    pub fn bad_request(message: &str, path: &str, request_id: &str) -> ErrorResponse {
        ErrorResponseBuilder::new(ErrorCode::BadRequest, message)
            .path(path)
            .request_id(request_id)
            .build()
    }

    pub fn bad_gateway(path: &str, request_id: &str) -> ErrorResponse {
        ErrorResponseBuilder::new(ErrorCode::BadGateway, "Upstream unavailable")
            .path(path)
            .request_id(request_id)
            .build()
    }
}
