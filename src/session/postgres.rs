// Postgres Session Store
// Networked relational backend shared by every provider of an outpost.
// All statements run through the credential-refreshing pool.

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::base::BaseStore;
use super::maintenance::{BatchDelete, CleanupPolicy, CleanupStats, Housekeeper, StoreHealth};
use super::record::ProxySession;
use super::retry::RetryConfig;
use super::{CleanupOutcome, Session, SessionFilter, SessionStore, StoreError};
use crate::claims::Claims;
use crate::credentials::CredentialSource;
use crate::database::{Connector, DsnSource, RefreshablePool};
use crate::scheduler::{CleanupManager, CleanupTarget, DEFAULT_RUN_TIMEOUT};

const DEFAULT_CONN_MAX_AGE: Duration = Duration::from_secs(3600);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT_OPTION: &str = "connect_timeout";

const UPSERT: &str = r#"
    INSERT INTO proxy_sessions
        (id, provider_id, session_key, session_data, claims, redirect, expires, expiring, created_at, updated_at, deleted_at)
    VALUES ($1, $2, $3, $4, $5::jsonb, $6, $7, $8, $9, $9, NULL)
    ON CONFLICT (provider_id, session_key) DO UPDATE SET
        session_data = EXCLUDED.session_data,
        claims = EXCLUDED.claims,
        redirect = EXCLUDED.redirect,
        expires = EXCLUDED.expires,
        expiring = EXCLUDED.expiring,
        updated_at = EXCLUDED.updated_at,
        deleted_at = NULL
"#;

const SELECT_LIVE: &str = r#"
    SELECT id, provider_id, session_key, session_data, claims::text AS claims, redirect,
           expires, expiring, created_at, updated_at, deleted_at
    FROM proxy_sessions
    WHERE provider_id = $1 AND deleted_at IS NULL AND (expires IS NULL OR expires > NOW())
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Allow => "allow",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

/// Connection settings. Host, user, password and database name may be
/// `env://` or `file://` references and are re-read on every reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    pub host: CredentialSource,
    pub port: u16,
    pub user: CredentialSource,
    pub password: CredentialSource,
    pub name: CredentialSource,
    pub sslmode: SslMode,
    pub sslrootcert: Option<PathBuf>,
    pub sslcert: Option<PathBuf>,
    pub sslkey: Option<PathBuf>,
    /// Becomes the session `search_path`
    pub default_schema: Option<String>,
    /// Base64-encoded JSON object of extra connection parameters
    pub conn_options: Option<String>,
    /// Connection lifetime in seconds, 0 for the default of one hour
    pub conn_max_age: u64,
    pub max_idle: u32,
    pub max_open: u32,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: CredentialSource::from("localhost"),
            port: 5432,
            user: CredentialSource::default(),
            password: CredentialSource::default(),
            name: CredentialSource::default(),
            sslmode: SslMode::default(),
            sslrootcert: None,
            sslcert: None,
            sslkey: None,
            default_schema: None,
            conn_options: None,
            conn_max_age: 0,
            max_idle: 10,
            max_open: 100,
        }
    }
}

fn resolve(field: &str, source: &CredentialSource) -> Result<String, StoreError> {
    source
        .resolve()
        .map_err(|e| StoreError::Configuration(format!("PostgreSQL {}: {}", field, e)))
}

fn option_value(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

impl PostgresSettings {
    /// Checks that do not require resolving credential references
    pub fn validate(&self) -> Result<(), StoreError> {
        for (field, source) in [("host", &self.host), ("user", &self.user), ("name", &self.name)] {
            if source.is_empty() {
                return Err(StoreError::Configuration(format!(
                    "PostgreSQL {} is required",
                    field
                )));
            }
        }
        if self.port == 0 {
            return Err(StoreError::Configuration(
                "PostgreSQL port must be positive".to_string(),
            ));
        }
        if self.max_open == 0 {
            return Err(StoreError::Configuration(
                "PostgreSQL max_open must be positive".to_string(),
            ));
        }
        self.conn_options()?;
        Ok(())
    }

    /// Decoded `conn_options`, every value rendered as a string
    pub fn conn_options(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let Some(encoded) = self.conn_options.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(BTreeMap::new());
        };
        let decoded = STANDARD.decode(encoded.trim()).map_err(|e| {
            StoreError::Configuration(format!("conn_options is not valid base64: {}", e))
        })?;
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&decoded)
            .map_err(|e| StoreError::Configuration(format!("conn_options is not a JSON object: {}", e)))?;
        Ok(map
            .into_iter()
            .map(|(key, value)| (key, option_value(value)))
            .collect())
    }

    /// `connect_timeout` from `conn_options`, used as the pool acquire timeout
    pub fn connect_timeout(&self) -> Result<Option<Duration>, StoreError> {
        let options = self.conn_options()?;
        let Some(value) = options.get(CONNECT_TIMEOUT_OPTION) else {
            return Ok(None);
        };
        value
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|e| StoreError::Configuration(format!("invalid connect_timeout value: {}", e)))
    }

    pub fn conn_max_lifetime(&self) -> Duration {
        if self.conn_max_age > 0 {
            Duration::from_secs(self.conn_max_age)
        } else {
            DEFAULT_CONN_MAX_AGE
        }
    }

    /// Connection URL from freshly resolved credentials
    pub fn build_dsn(&self) -> Result<String, StoreError> {
        self.validate()?;
        let host = resolve("host", &self.host)?;
        let user = resolve("user", &self.user)?;
        let password = resolve("password", &self.password)?;
        let name = resolve("name", &self.name)?;
        for (field, value) in [("host", &host), ("user", &user), ("name", &name)] {
            if value.is_empty() {
                return Err(StoreError::Configuration(format!(
                    "PostgreSQL {} resolved to an empty value",
                    field
                )));
            }
        }

        let invalid = |what: &str| StoreError::Configuration(format!("invalid PostgreSQL {}", what));
        let mut url = Url::parse("postgres://localhost").map_err(|_| invalid("URL"))?;
        url.set_host(Some(&host)).map_err(|_| invalid("host"))?;
        url.set_port(Some(self.port)).map_err(|_| invalid("port"))?;
        url.set_username(&user).map_err(|_| invalid("user"))?;
        if !password.is_empty() {
            url.set_password(Some(&password))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(&name);

        let mut runtime = Vec::new();
        if let Some(schema) = self.default_schema.as_deref().filter(|s| !s.is_empty()) {
            runtime.push(format!("-c search_path={}", schema));
        }
        for (key, value) in self.conn_options()? {
            if key != CONNECT_TIMEOUT_OPTION {
                runtime.push(format!("-c {}={}", key, value));
            }
        }

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sslmode", self.sslmode.as_str());
            for (key, path) in [
                ("sslrootcert", &self.sslrootcert),
                ("sslcert", &self.sslcert),
                ("sslkey", &self.sslkey),
            ] {
                if let Some(path) = path {
                    query.append_pair(key, &path.to_string_lossy());
                }
            }
            if !runtime.is_empty() {
                query.append_pair("options", &runtime.join(" "));
            }
        }
        Ok(url.to_string())
    }
}

/// Re-resolves [`PostgresSettings`] into a DSN on every call
pub struct SettingsDsn(pub PostgresSettings);

impl DsnSource for SettingsDsn {
    fn dsn(&self) -> Result<String, StoreError> {
        self.0.build_dsn()
    }
}

/// Opens `sqlx` Postgres pools
#[derive(Debug, Clone)]
pub struct PgConnector {
    pub max_open: u32,
    /// Warm connections kept open
    pub min_idle: u32,
    pub max_lifetime: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self {
            max_open: 100,
            min_idle: 10,
            max_lifetime: DEFAULT_CONN_MAX_AGE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl PgConnector {
    pub fn from_settings(settings: &PostgresSettings) -> Result<Self, StoreError> {
        Ok(Self {
            max_open: settings.max_open,
            min_idle: settings.max_idle.min(settings.max_open),
            max_lifetime: settings.conn_max_lifetime(),
            acquire_timeout: settings
                .connect_timeout()?
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
        })
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Handle = PgPool;

    async fn connect(&self, dsn: &str) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_open)
            .min_connections(self.min_idle)
            .max_lifetime(self.max_lifetime)
            .acquire_timeout(self.acquire_timeout)
            .connect(dsn)
            .await?;
        Ok(pool)
    }

    async fn close(&self, handle: PgPool) {
        handle.close().await;
    }
}

fn record_from_row(row: &PgRow) -> Result<ProxySession, StoreError> {
    Ok(ProxySession {
        id: row.try_get("id")?,
        provider_id: row.try_get("provider_id")?,
        session_key: row.try_get("session_key")?,
        session_data: row.try_get("session_data")?,
        claims: row.try_get("claims")?,
        redirect: row.try_get("redirect")?,
        expires: row.try_get("expires")?,
        expiring: row.try_get("expiring")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

struct PostgresInner {
    base: BaseStore,
    pool: RefreshablePool<PgConnector>,
    retry: RetryConfig,
    housekeeper: Housekeeper,
}

pub struct PostgresStore {
    inner: Arc<PostgresInner>,
    cleanup: CleanupManager,
}

impl PostgresStore {
    pub async fn connect(
        base: BaseStore,
        settings: &PostgresSettings,
        policy: CleanupPolicy,
        cleanup_interval: Duration,
    ) -> Result<Self, StoreError> {
        settings.validate()?;
        let connector = PgConnector::from_settings(settings)?;
        Self::with_source(
            base,
            connector,
            Arc::new(SettingsDsn(settings.clone())),
            policy,
            cleanup_interval,
        )
        .await
    }

    /// Connect with an explicit DSN source and apply migrations
    pub async fn with_source(
        base: BaseStore,
        connector: PgConnector,
        source: Arc<dyn DsnSource>,
        policy: CleanupPolicy,
        cleanup_interval: Duration,
    ) -> Result<Self, StoreError> {
        let pool = RefreshablePool::connect(connector, source).await?;
        pool.execute(|pg| async move {
            sqlx::migrate!("./migrations/postgres").run(&pg).await?;
            Ok(())
        })
        .await?;

        info!(provider = %base.provider_id(), "Using Postgres session store");
        let label = format!("postgres:{}", base.provider_id());
        Ok(Self {
            inner: Arc::new(PostgresInner {
                base,
                pool,
                retry: RetryConfig::default(),
                housekeeper: Housekeeper::new(label, policy),
            }),
            cleanup: CleanupManager::new(cleanup_interval, DEFAULT_RUN_TIMEOUT),
        })
    }

    pub fn start_cleanup(&self) -> bool {
        self.cleanup.start(self.inner.clone())
    }

    pub fn base(&self) -> &BaseStore {
        &self.inner.base
    }

    pub fn pool(&self) -> &RefreshablePool<PgConnector> {
        &self.inner.pool
    }

    pub async fn cleanup_stats(&self) -> CleanupStats {
        self.inner.housekeeper.stats().await
    }

    pub async fn health(&self) -> StoreHealth {
        self.inner.housekeeper.health(self.inner.as_ref()).await
    }
}

impl PostgresInner {
    async fn load(&self, key: &str, name: &str) -> Result<Option<Session>, StoreError> {
        let pool = &self.pool;
        let provider_id = self.base.provider_id();
        let row = self
            .retry
            .run_bounded("load", move || async move {
                pool.execute(move |pg| async move {
                    let query = format!("{} AND session_key = $2", SELECT_LIVE);
                    Ok(sqlx::query(&query)
                        .bind(provider_id)
                        .bind(key)
                        .fetch_optional(&pg)
                        .await?)
                })
                .await
            })
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        match record_from_row(&row).and_then(|r| r.into_session(&self.base, name, self.base.options())) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(provider = %provider_id, error = %e, "Discarding undecodable session row");
                Ok(None)
            }
        }
    }

    async fn upsert(&self, record: &ProxySession) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.retry
            .run_bounded("save", move || async move {
                pool.execute(move |pg| async move {
                    sqlx::query(UPSERT)
                        .bind(record.id)
                        .bind(&record.provider_id)
                        .bind(&record.session_key)
                        .bind(&record.session_data)
                        .bind(&record.claims)
                        .bind(&record.redirect)
                        .bind(record.expires)
                        .bind(record.expiring)
                        .bind(record.updated_at)
                        .execute(&pg)
                        .await?;
                    Ok(())
                })
                .await
            })
            .await
    }

    async fn soft_delete(&self, key: &str) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let provider_id = self.base.provider_id();
        let affected = self
            .retry
            .run_bounded("delete", move || async move {
                pool.execute(move |pg| async move {
                    let result = sqlx::query(
                        "UPDATE proxy_sessions SET deleted_at = NOW(), updated_at = NOW() \
                         WHERE provider_id = $1 AND session_key = $2 AND deleted_at IS NULL",
                    )
                    .bind(provider_id)
                    .bind(key)
                    .execute(&pg)
                    .await?;
                    Ok(result.rows_affected())
                })
                .await
            })
            .await?;
        if affected == 0 {
            warn!(provider = %provider_id, "No rows affected by session deletion");
        } else {
            debug!(provider = %provider_id, rows_affected = affected, "Soft deleted session");
        }
        Ok(affected)
    }

    async fn live_records(&self) -> Result<Vec<ProxySession>, StoreError> {
        let pool = &self.pool;
        let provider_id = self.base.provider_id();
        let rows = self
            .retry
            .run_bounded("get_all", move || async move {
                pool.execute(move |pg| async move {
                    Ok(sqlx::query(SELECT_LIVE)
                        .bind(provider_id)
                        .fetch_all(&pg)
                        .await?)
                })
                .await
            })
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| match record_from_row(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(provider = %provider_id, error = %e, "Skipping undecodable session row");
                    None
                }
            })
            .collect())
    }

    /// Tombstone every live row whose top-level claim `field` equals `value`
    async fn logout_by_claim(&self, field: &'static str, value: &str) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let provider_id = self.base.provider_id();
        self.retry
            .run_bounded("logout", move || async move {
                pool.execute(move |pg| async move {
                    let result = sqlx::query(
                        "UPDATE proxy_sessions SET deleted_at = NOW(), updated_at = NOW() \
                         WHERE provider_id = $1 AND deleted_at IS NULL AND claims ->> $2 = $3",
                    )
                    .bind(provider_id)
                    .bind(field)
                    .bind(value)
                    .execute(&pg)
                    .await?;
                    Ok(result.rows_affected())
                })
                .await
            })
            .await
    }
}

#[async_trait]
impl BatchDelete for PostgresInner {
    async fn delete_expired(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, StoreError> {
        let provider_id = self.base.provider_id();
        self.pool
            .execute(move |pg| async move {
                let result = sqlx::query(
                    "DELETE FROM proxy_sessions WHERE id IN (\
                        SELECT id FROM proxy_sessions \
                        WHERE provider_id = $1 AND expires IS NOT NULL AND expires < $2 LIMIT $3)",
                )
                .bind(provider_id)
                .bind(cutoff)
                .bind(limit)
                .execute(&pg)
                .await?;
                Ok(result.rows_affected())
            })
            .await
    }

    async fn delete_soft_deleted(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let provider_id = self.base.provider_id();
        self.pool
            .execute(move |pg| async move {
                let result = sqlx::query(
                    "DELETE FROM proxy_sessions WHERE id IN (\
                        SELECT id FROM proxy_sessions \
                        WHERE provider_id = $1 AND deleted_at IS NOT NULL AND deleted_at < $2 LIMIT $3)",
                )
                .bind(provider_id)
                .bind(cutoff)
                .bind(limit)
                .execute(&pg)
                .await?;
                Ok(result.rows_affected())
            })
            .await
    }

    // autovacuum reclaims space
    async fn vacuum(&self) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.pool
            .execute(|pg| async move {
                sqlx::query("SELECT 1").execute(&pg).await?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl CleanupTarget for PostgresInner {
    fn label(&self) -> String {
        self.housekeeper.label().to_string()
    }

    async fn run_cleanup(&self) -> Result<CleanupOutcome, StoreError> {
        self.housekeeper.run(self).await
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn new_session(&self, headers: &HeaderMap, name: &str) -> Result<Session, StoreError> {
        let inner = &self.inner;
        inner
            .base
            .observe("load", async {
                let Some(id) = inner.base.session_id_from_request(headers, name) else {
                    return Ok(inner.base.fresh_session(name));
                };
                Ok(inner
                    .load(&id, name)
                    .await?
                    .unwrap_or_else(|| inner.base.fresh_session(name)))
            })
            .await
    }

    async fn save(
        &self,
        _headers: &HeaderMap,
        response: &mut HeaderMap,
        session: &mut Session,
    ) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner
            .base
            .observe("save", async {
                if session.options.max_age <= 0 {
                    if !session.id().is_empty() {
                        inner.soft_delete(session.id()).await?;
                    }
                    return inner.base.expire_cookie(response, session);
                }
                if session.id().is_empty() {
                    session.assign_id(BaseStore::generate_id());
                }
                let record = ProxySession::from_session(&inner.base, session)?;
                inner.upsert(&record).await?;
                inner.base.write_session_cookie(response, session)
            })
            .await
    }

    async fn delete(&self, session: &Session) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner
            .base
            .observe("delete", async {
                inner.soft_delete(session.id()).await?;
                Ok(())
            })
            .await
    }

    async fn get_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let inner = &self.inner;
        inner
            .base
            .observe("get_all", async {
                let mut sessions = Vec::new();
                for record in inner.live_records().await? {
                    match record.into_session(&inner.base, "", inner.base.options()) {
                        Ok(session) => sessions.push(session),
                        Err(e) => {
                            warn!(provider = %inner.base.provider_id(), error = %e, "Skipping undecodable session");
                        }
                    }
                }
                Ok(sessions)
            })
            .await
    }

    async fn cleanup(&self) -> Result<CleanupOutcome, StoreError> {
        self.inner
            .base
            .observe("cleanup", self.inner.run_cleanup())
            .await
    }

    async fn logout_sessions(&self, filter: &SessionFilter) -> Result<u64, StoreError> {
        let inner = &self.inner;
        inner
            .base
            .observe("logout", async {
                match filter {
                    SessionFilter::Subject(sub) => inner.logout_by_claim("sub", sub).await,
                    SessionFilter::SessionId(sid) => inner.logout_by_claim("sid", sid).await,
                    SessionFilter::Predicate(_) => {
                        let mut removed = 0;
                        for record in inner.live_records().await? {
                            let Ok(claims) = serde_json::from_str::<Claims>(&record.claims) else {
                                continue;
                            };
                            if filter.matches(&claims) {
                                removed += inner.soft_delete(&record.session_key).await?;
                            }
                        }
                        Ok(removed)
                    }
                }
            })
            .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.housekeeper.close();
        self.cleanup.stop().await;
        self.inner.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PostgresSettings {
        PostgresSettings {
            host: "db.internal".into(),
            user: "authentik".into(),
            password: "p@ss word".into(),
            name: "authentik".into(),
            ..Default::default()
        }
    }

    #[test]
    fn builds_escaped_dsn() {
        let dsn = settings().build_dsn().unwrap();
        let url = Url::parse(&dsn).unwrap();
        assert_eq!(url.scheme(), "postgres");
        assert_eq!(url.host_str(), Some("db.internal"));
        assert_eq!(url.port(), Some(5432));
        assert_eq!(url.username(), "authentik");
        assert_eq!(
            urlencoding::decode(url.password().unwrap()).unwrap(),
            "p@ss word"
        );
        assert_eq!(url.path(), "/authentik");
        assert!(url.query_pairs().any(|(k, v)| k == "sslmode" && v == "prefer"));
    }

    #[test]
    fn schema_and_options_become_runtime_parameters() {
        let encoded = STANDARD.encode(r#"{"connect_timeout": 7, "statement_timeout": "5s"}"#);
        let settings = PostgresSettings {
            default_schema: Some("sessions".into()),
            conn_options: Some(encoded),
            sslmode: SslMode::VerifyFull,
            sslrootcert: Some(PathBuf::from("/etc/ssl/ca.pem")),
            ..settings()
        };

        assert_eq!(
            settings.connect_timeout().unwrap(),
            Some(Duration::from_secs(7))
        );
        let url = Url::parse(&settings.build_dsn().unwrap()).unwrap();
        let pairs: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["sslmode"], "verify-full");
        assert_eq!(pairs["sslrootcert"], "/etc/ssl/ca.pem");
        assert_eq!(
            pairs["options"],
            "-c search_path=sessions -c statement_timeout=5s"
        );

        let connector = PgConnector::from_settings(&settings).unwrap();
        assert_eq!(connector.acquire_timeout, Duration::from_secs(7));
        assert_eq!(connector.max_lifetime, DEFAULT_CONN_MAX_AGE);
        assert_eq!(connector.min_idle, 10);
    }

    #[test]
    fn validation_rejects_missing_fields() {
        let missing_host = PostgresSettings {
            host: "".into(),
            ..settings()
        };
        assert!(matches!(
            missing_host.validate(),
            Err(StoreError::Configuration(_))
        ));

        let zero_port = PostgresSettings {
            port: 0,
            ..settings()
        };
        assert!(zero_port.build_dsn().is_err());

        let bad_options = PostgresSettings {
            conn_options: Some("not base64!".into()),
            ..settings()
        };
        assert!(bad_options.validate().is_err());
    }

    #[test]
    fn credentials_are_resolved_on_each_call() {
        let dir = tempfile::tempdir().unwrap();
        let secret = dir.path().join("password");
        std::fs::write(&secret, "first\n").unwrap();
        let source = SettingsDsn(PostgresSettings {
            password: CredentialSource::FileRef(secret.clone()),
            ..settings()
        });

        let first = source.dsn().unwrap();
        std::fs::write(&secret, "second").unwrap();
        let second = source.dsn().unwrap();
        assert!(first.contains(":first@"));
        assert!(second.contains(":second@"));
    }

    #[test]
    fn sslmode_uses_libpq_names() {
        let mode: SslMode = serde_json::from_str("\"verify-ca\"").unwrap();
        assert_eq!(mode, SslMode::VerifyCa);
        assert_eq!(SslMode::default().as_str(), "prefer");
    }
}
