// SQLite Session Store
// Embedded relational backend: one database file per provider, rows
// upserted on save, tombstoned on delete and hard-deleted in batches

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::base::BaseStore;
use super::maintenance::{BatchDelete, CleanupPolicy, CleanupStats, Housekeeper, StoreHealth};
use super::record::ProxySession;
use super::retry::RetryConfig;
use super::{CleanupOutcome, Session, SessionFilter, SessionStore, StoreError};
use crate::claims::Claims;
use crate::scheduler::{CleanupManager, CleanupTarget, DEFAULT_RUN_TIMEOUT};

pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

const SESSION_DIR: &str = "authentik-sessions";
const MAX_CONNECTIONS: u32 = 5;

const UPSERT: &str = r#"
    INSERT INTO proxy_sessions
        (id, provider_id, session_key, session_data, claims, redirect, expires, expiring, created_at, updated_at, deleted_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, NULL)
    ON CONFLICT (provider_id, session_key) DO UPDATE SET
        session_data = excluded.session_data,
        claims = excluded.claims,
        redirect = excluded.redirect,
        expires = excluded.expires,
        expiring = excluded.expiring,
        updated_at = excluded.updated_at,
        deleted_at = NULL
"#;

const SELECT_LIVE: &str = r#"
    SELECT id, provider_id, session_key, session_data, claims, redirect, expires, expiring,
           created_at, updated_at, deleted_at
    FROM proxy_sessions
    WHERE provider_id = ?1 AND deleted_at IS NULL AND (expires IS NULL OR expires > ?2)
"#;

/// Default database location for a provider: tmpfs when available
pub fn default_path(provider_id: &str) -> PathBuf {
    let file: String = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let shm = Path::new("/dev/shm");
    let dir = if shm.is_dir() {
        shm.join(SESSION_DIR)
    } else {
        std::env::temp_dir().join(SESSION_DIR)
    };
    dir.join(format!("{}.db", file))
}

/// Configured interval, or the default; never below one minute
pub fn cleanup_interval(requested: Option<Duration>) -> Duration {
    requested
        .unwrap_or(DEFAULT_CLEANUP_INTERVAL)
        .max(MIN_CLEANUP_INTERVAL)
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn record_from_row(row: &SqliteRow) -> Result<ProxySession, StoreError> {
    let id: String = row.try_get("id")?;
    Ok(ProxySession {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Serialization(e.to_string()))?,
        provider_id: row.try_get("provider_id")?,
        session_key: row.try_get("session_key")?,
        session_data: row.try_get("session_data")?,
        claims: row.try_get("claims")?,
        redirect: row.try_get("redirect")?,
        expires: row.try_get::<Option<i64>, _>("expires")?.and_then(from_unix),
        expiring: row.try_get("expiring")?,
        created_at: from_unix(row.try_get("created_at")?).unwrap_or_default(),
        updated_at: from_unix(row.try_get("updated_at")?).unwrap_or_default(),
        deleted_at: row.try_get::<Option<i64>, _>("deleted_at")?.and_then(from_unix),
    })
}

struct SqliteInner {
    base: BaseStore,
    pool: SqlitePool,
    path: PathBuf,
    retry: RetryConfig,
    housekeeper: Housekeeper,
}

pub struct SqliteStore {
    inner: Arc<SqliteInner>,
    cleanup: CleanupManager,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply migrations
    pub async fn open(
        base: BaseStore,
        path: impl Into<PathBuf>,
        policy: CleanupPolicy,
        cleanup_interval: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Configuration(format!(
                    "cannot create session directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(5000))
            .foreign_keys(true)
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-8000")
            .pragma("secure_delete", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations/sqlite").run(&pool).await?;

        info!(
            path = %path.display(),
            provider = %base.provider_id(),
            "Using SQLite session store"
        );
        let label = format!("sqlite:{}", base.provider_id());
        Ok(Self {
            inner: Arc::new(SqliteInner {
                base,
                pool,
                path,
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

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub async fn cleanup_stats(&self) -> CleanupStats {
        self.inner.housekeeper.stats().await
    }

    pub async fn health(&self) -> StoreHealth {
        self.inner.housekeeper.health(self.inner.as_ref()).await
    }
}

impl SqliteInner {
    async fn load(&self, key: &str, name: &str) -> Result<Option<Session>, StoreError> {
        let pool = &self.pool;
        let provider_id = self.base.provider_id();
        let row = self
            .retry
            .run_bounded("load", move || async move {
                let query = format!("{} AND session_key = ?3", SELECT_LIVE);
                Ok(sqlx::query(&query)
                    .bind(provider_id)
                    .bind(Utc::now().timestamp())
                    .bind(key)
                    .fetch_optional(pool)
                    .await?)
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
                sqlx::query(UPSERT)
                    .bind(record.id.to_string())
                    .bind(&record.provider_id)
                    .bind(&record.session_key)
                    .bind(&record.session_data)
                    .bind(&record.claims)
                    .bind(&record.redirect)
                    .bind(record.expires.map(|e| e.timestamp()))
                    .bind(record.expiring)
                    .bind(record.updated_at.timestamp())
                    .execute(pool)
                    .await?;
                Ok(())
            })
            .await
    }

    async fn soft_delete(&self, key: &str) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let provider_id = self.base.provider_id();
        let affected = self
            .retry
            .run_bounded("delete", move || async move {
                let now = Utc::now().timestamp();
                let result = sqlx::query(
                    "UPDATE proxy_sessions SET deleted_at = ?1, updated_at = ?1 \
                     WHERE provider_id = ?2 AND session_key = ?3 AND deleted_at IS NULL",
                )
                .bind(now)
                .bind(provider_id)
                .bind(key)
                .execute(pool)
                .await?;
                Ok(result.rows_affected())
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
                Ok(sqlx::query(SELECT_LIVE)
                    .bind(provider_id)
                    .bind(Utc::now().timestamp())
                    .fetch_all(pool)
                    .await?)
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

    /// Tombstone every live row whose claims field equals `value`
    async fn logout_by_claim(&self, path: &'static str, value: &str) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let provider_id = self.base.provider_id();
        self.retry
            .run_bounded("logout", move || async move {
                let now = Utc::now().timestamp();
                let result = sqlx::query(
                    "UPDATE proxy_sessions SET deleted_at = ?1, updated_at = ?1 \
                     WHERE provider_id = ?2 AND deleted_at IS NULL AND json_extract(claims, ?3) = ?4",
                )
                .bind(now)
                .bind(provider_id)
                .bind(path)
                .bind(value)
                .execute(pool)
                .await?;
                Ok(result.rows_affected())
            })
            .await
    }
}

#[async_trait]
impl BatchDelete for SqliteInner {
    async fn delete_expired(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM proxy_sessions WHERE id IN (\
                SELECT id FROM proxy_sessions \
                WHERE provider_id = ?1 AND expires IS NOT NULL AND expires < ?2 LIMIT ?3)",
        )
        .bind(self.base.provider_id())
        .bind(cutoff.timestamp())
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_soft_deleted(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM proxy_sessions WHERE id IN (\
                SELECT id FROM proxy_sessions \
                WHERE provider_id = ?1 AND deleted_at IS NOT NULL AND deleted_at < ?2 LIMIT ?3)",
        )
        .bind(self.base.provider_id())
        .bind(cutoff.timestamp())
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn vacuum(&self) -> Result<bool, StoreError> {
        info!(path = %self.path.display(), "Starting database vacuum");
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CleanupTarget for SqliteInner {
    fn label(&self) -> String {
        self.housekeeper.label().to_string()
    }

    async fn run_cleanup(&self) -> Result<CleanupOutcome, StoreError> {
        self.housekeeper.run(self).await
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
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
                    SessionFilter::Subject(sub) => inner.logout_by_claim("$.sub", sub).await,
                    SessionFilter::SessionId(sid) => inner.logout_by_claim("$.sid", sid).await,
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
