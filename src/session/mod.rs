// Session Storage Module
// Session model, the store contract and its backends

pub mod base;
pub mod cookie;
pub mod factory;
pub mod filesystem;
pub mod maintenance;
pub mod metrics;
pub mod postgres;
pub mod record;
pub mod retry;
pub mod serializer;
pub mod sqlite;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::claims::Claims;

pub use base::{BaseStore, CookieCodec};
pub use cookie::CookieStore;
pub use factory::{SerializerKind, StorageBackend, StorageConfig, build_session_store};
pub use filesystem::FilesystemStore;
pub use maintenance::{CleanupPolicy, CleanupStats, HealthStatus, StoreHealth};
pub use metrics::StoreMetrics;
pub use postgres::{PostgresSettings, PostgresStore};
pub use record::ProxySession;
pub use retry::RetryConfig;
pub use serializer::{BinarySerializer, JsonSerializer, SessionSerializer};
pub use sqlite::SqliteStore;

/// Session value key holding the serialized [`Claims`]
pub const CLAIMS_KEY: &str = "claims";
/// Session value key holding the post-login destination
pub const REDIRECT_KEY: &str = "redirect";
/// Session value key holding outstanding OAuth state nonces
pub const OAUTH_STATE_KEY: &str = "oauth_state";

/// Default session lifetime (30 days)
pub const DEFAULT_MAX_AGE: i64 = 86400 * 30;

/// Session store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session store configuration error: {0}")]
    Configuration(String),

    #[error("Database authentication failed: {0}")]
    Authentication(String),

    #[error("Session store connection failed: {0}")]
    Transport(String),

    #[error("Session store query failed: {0}")]
    Query(String),

    #[error("Session serialization failed: {0}")]
    Serialization(String),

    #[error("Cleanup is already running")]
    CleanupAlreadyRunning,

    #[error("Session store operation timed out: {0}")]
    Timeout(&'static str),

    #[error("Session store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const NON_RETRYABLE_MARKERS: &[&str] = &[
    "constraint",
    "foreign key",
    "unique",
    "check constraint",
    "invalid input",
    "validation",
    "parse error",
];

impl StoreError {
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::Timeout(_) => 504,
            StoreError::Transport(_) | StoreError::Authentication(_) => 503,
            StoreError::CleanupAlreadyRunning => 409,
            _ => 500,
        }
    }

    /// Transient failures that may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) | StoreError::Timeout(_) => true,
            StoreError::Query(message) => {
                let lowered = message.to_lowercase();
                !NON_RETRYABLE_MARKERS
                    .iter()
                    .any(|marker| lowered.contains(marker))
            }
            _ => false,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, StoreError::Authentication(_))
    }
}

// SQLSTATE codes for invalid password / invalid authorization specification
const AUTH_ERROR_CODES: &[&str] = &["28P01", "28000"];
const AUTH_ERROR_MESSAGES: &[&str] = &[
    "password authentication failed",
    "invalid authorization specification",
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
                let message = db_err.message().to_lowercase();
                if AUTH_ERROR_CODES.contains(&code.as_str())
                    || AUTH_ERROR_MESSAGES.iter().any(|m| message.contains(m))
                {
                    StoreError::Authentication(err.to_string())
                } else {
                    StoreError::Query(err.to_string())
                }
            }
            sqlx::Error::Configuration(_) => StoreError::Configuration(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => {
                let message = err.to_string();
                let lowered = message.to_lowercase();
                if AUTH_ERROR_MESSAGES.iter().any(|m| lowered.contains(m)) {
                    StoreError::Authentication(message)
                } else {
                    StoreError::Transport(message)
                }
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Configuration(format!("migration failed: {}", err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// SameSite cookie attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Cookie attributes of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub path: String,
    pub domain: Option<String>,
    /// Lifetime in seconds; zero or negative deletes the session
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            max_age: DEFAULT_MAX_AGE,
            secure: false,
            http_only: true,
            same_site: SameSite::Lax,
        }
    }
}

/// Named session values
pub type SessionValues = HashMap<String, serde_json::Value>;

/// A session resolved by a store
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    name: String,
    pub values: SessionValues,
    pub options: SessionOptions,
    is_new: bool,
}

impl Session {
    /// Fresh, empty session without an id
    pub fn new(name: impl Into<String>, options: SessionOptions) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            values: SessionValues::new(),
            options,
            is_new: true,
        }
    }

    /// Session restored from storage
    pub fn restored(
        id: impl Into<String>,
        name: impl Into<String>,
        values: SessionValues,
        options: SessionOptions,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            values,
            options,
            is_new: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn assign_id(&mut self, id: String) {
        self.id = id;
    }

    /// Claims stored in the session, if any decode cleanly
    pub fn claims(&self) -> Option<Claims> {
        self.values
            .get(CLAIMS_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_claims(&mut self, claims: &Claims) -> Result<(), StoreError> {
        self.values
            .insert(CLAIMS_KEY.to_string(), serde_json::to_value(claims)?);
        Ok(())
    }

    pub fn clear_claims(&mut self) {
        self.values.remove(CLAIMS_KEY);
    }

    pub fn redirect(&self) -> Option<&str> {
        self.values
            .get(REDIRECT_KEY)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }

    pub fn set_redirect(&mut self, redirect: impl Into<String>) {
        self.values.insert(
            REDIRECT_KEY.to_string(),
            serde_json::Value::String(redirect.into()),
        );
    }

    pub fn clear_redirect(&mut self) {
        self.values.remove(REDIRECT_KEY);
    }

    /// Outstanding OAuth state nonces
    pub fn oauth_states(&self) -> Vec<String> {
        self.values
            .get(OAUTH_STATE_KEY)
            .and_then(|value| value.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_oauth_states(&mut self, states: Vec<String>) {
        if states.is_empty() {
            self.values.remove(OAUTH_STATE_KEY);
        } else {
            self.values.insert(
                OAUTH_STATE_KEY.to_string(),
                serde_json::Value::from(states),
            );
        }
    }

    /// Claims as JSON text for the denormalized column
    pub(crate) fn claims_json(&self) -> String {
        self.values
            .get(CLAIMS_KEY)
            .map(|value| value.to_string())
            .unwrap_or_else(|| "{}".to_string())
    }
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub removed: u64,
}

/// Selects sessions for bulk sign-out
#[derive(Clone)]
pub enum SessionFilter {
    Subject(String),
    SessionId(String),
    Predicate(Arc<dyn Fn(&Claims) -> bool + Send + Sync>),
}

impl SessionFilter {
    pub fn matches(&self, claims: &Claims) -> bool {
        match self {
            SessionFilter::Subject(sub) => &claims.sub == sub,
            SessionFilter::SessionId(sid) => &claims.sid == sid,
            SessionFilter::Predicate(predicate) => predicate(claims),
        }
    }
}

impl fmt::Debug for SessionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionFilter::Subject(sub) => f.debug_tuple("Subject").field(sub).finish(),
            SessionFilter::SessionId(sid) => f.debug_tuple("SessionId").field(sid).finish(),
            SessionFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Uniform contract implemented by every session backend
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name used in logs and metrics
    fn backend(&self) -> &'static str;

    /// Resolve the named session from the request cookies
    async fn get(&self, headers: &HeaderMap, name: &str) -> Result<Session, StoreError> {
        self.new_session(headers, name).await
    }

    /// Decode the session cookie, falling back to a fresh session
    async fn new_session(&self, headers: &HeaderMap, name: &str) -> Result<Session, StoreError>;

    /// Persist the session and write its cookie into `response`
    async fn save(
        &self,
        headers: &HeaderMap,
        response: &mut HeaderMap,
        session: &mut Session,
    ) -> Result<(), StoreError>;

    /// Soft delete
    async fn delete(&self, session: &Session) -> Result<(), StoreError>;

    /// Every live session of this provider
    async fn get_all_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn cleanup(&self) -> Result<CleanupOutcome, StoreError>;

    /// Soft delete every session whose claims match `filter`
    async fn logout_sessions(&self, filter: &SessionFilter) -> Result<u64, StoreError> {
        let mut removed = 0;
        for session in self.get_all_sessions().await? {
            let Some(claims) = session.claims() else {
                continue;
            };
            if filter.matches(&claims) {
                self.delete(&session).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), StoreError>;
}
