// Session Store Factory
// Chooses and constructs the backend for one provider

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::base::BaseStore;
use super::cookie::CookieStore;
use super::filesystem::FilesystemStore;
use super::maintenance::CleanupPolicy;
use super::postgres::{PostgresSettings, PostgresStore};
use super::serializer::{BinarySerializer, JsonSerializer, SessionSerializer};
use super::sqlite::{self, SqliteStore};
use super::{SessionOptions, SessionStore, StoreError};

const FILESYSTEM_DIR: &str = "authentik-sessions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Everything in the encrypted cookie
    #[default]
    #[serde(alias = "cookie")]
    Memory,
    Filesystem,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    #[default]
    Binary,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub serializer: SerializerKind,
    /// Parent directory for filesystem sessions; one sub-directory per provider
    pub filesystem_dir: Option<PathBuf>,
    /// SQLite database file; defaults to tmpfs per provider
    pub sqlite_path: Option<PathBuf>,
    pub postgres: PostgresSettings,
    pub cleanup_interval_secs: Option<u64>,
    pub cleanup: CleanupPolicy,
}

impl StorageConfig {
    pub fn cleanup_interval(&self) -> Duration {
        sqlite::cleanup_interval(self.cleanup_interval_secs.map(Duration::from_secs))
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.backend == StorageBackend::Postgres {
            self.postgres.validate()?;
        }
        if self.cleanup.batch_size <= 0 {
            return Err(StoreError::Configuration(
                "cleanup batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn serializer(&self) -> Arc<dyn SessionSerializer> {
        match self.serializer {
            SerializerKind::Binary => Arc::new(BinarySerializer),
            SerializerKind::Json => Arc::new(JsonSerializer),
        }
    }
}

fn path_segment(provider_id: &str) -> String {
    provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Build the store for `provider_id` and start its cleanup loop
pub async fn build_session_store(
    config: &StorageConfig,
    provider_id: &str,
    cookie_secret: &str,
    options: SessionOptions,
) -> Result<Arc<dyn SessionStore>, StoreError> {
    config.validate()?;
    let serializer = config.serializer();
    let base = |backend: &'static str| {
        BaseStore::new(backend, provider_id, cookie_secret, options.clone())
            .map(|base| base.with_serializer(serializer.clone()))
    };
    let interval = config.cleanup_interval();

    let store: Arc<dyn SessionStore> = match config.backend {
        StorageBackend::Memory => Arc::new(CookieStore::new(base("cookie")?)),
        StorageBackend::Filesystem => {
            let dir = config
                .filesystem_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join(FILESYSTEM_DIR))
                .join(path_segment(provider_id));
            let store = FilesystemStore::new(base("filesystem")?, dir, interval)?;
            store.start_cleanup();
            Arc::new(store)
        }
        StorageBackend::Sqlite => {
            let path = config
                .sqlite_path
                .clone()
                .unwrap_or_else(|| sqlite::default_path(provider_id));
            let store =
                SqliteStore::open(base("sqlite")?, path, config.cleanup.clone(), interval).await?;
            store.start_cleanup();
            Arc::new(store)
        }
        StorageBackend::Postgres => {
            let store = PostgresStore::connect(
                base("postgres")?,
                &config.postgres,
                config.cleanup.clone(),
                interval,
            )
            .await?;
            store.start_cleanup();
            Arc::new(store)
        }
    };
    info!(provider = %provider_id, backend = store.backend(), "Session store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[tokio::test]
    async fn builds_memory_store_by_default() {
        let store = build_session_store(
            &StorageConfig::default(),
            "1",
            "secret",
            SessionOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(store.backend(), "cookie");
    }

    #[tokio::test]
    async fn filesystem_store_is_scoped_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Filesystem,
            serializer: SerializerKind::Json,
            filesystem_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let store = build_session_store(&config, "provider/7", "secret", SessionOptions::default())
            .await
            .unwrap();
        assert_eq!(store.backend(), "filesystem");
        assert!(dir.path().join("provider_7").is_dir());

        let mut session = store.get(&HeaderMap::new(), "sess").await.unwrap();
        store
            .save(&HeaderMap::new(), &mut HeaderMap::new(), &mut session)
            .await
            .unwrap();
        assert!(!session.id().is_empty());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn builds_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Sqlite,
            sqlite_path: Some(dir.path().join("outpost.db")),
            ..Default::default()
        };
        let store = build_session_store(&config, "1", "secret", SessionOptions::default())
            .await
            .unwrap();
        assert_eq!(store.backend(), "sqlite");
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn empty_cookie_secret_is_fatal() {
        let result =
            build_session_store(&StorageConfig::default(), "1", "", SessionOptions::default())
                .await;
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[test]
    fn backend_names_parse() {
        let backend: StorageBackend = serde_json::from_str("\"cookie\"").unwrap();
        assert_eq!(backend, StorageBackend::Memory);
        let backend: StorageBackend = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(backend, StorageBackend::Postgres);
    }

    #[test]
    fn postgres_settings_are_validated() {
        let config = StorageConfig {
            backend: StorageBackend::Postgres,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
