// Filesystem Session Store
// One file per session; deletion leaves a tombstone that the cleanup sweep removes

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use super::base::BaseStore;
use super::{CleanupOutcome, Session, SessionStore, StoreError};
use crate::scheduler::{CleanupManager, CleanupTarget, DEFAULT_RUN_TIMEOUT};

const FILE_PREFIX: &str = "session_";
const TOMBSTONE_SUFFIX: &str = ".deleted";
const LOCK_FILE: &str = ".cleanup.lock";
const EXPIRY_LEN: usize = 8;
const TMP_PREFIX: &str = ".tmp-";
/// Partial writes younger than this may still be in progress
const TMP_RETENTION: Duration = Duration::from_secs(24 * 3600);

struct FilesystemInner {
    base: BaseStore,
    dir: PathBuf,
}

pub struct FilesystemStore {
    inner: Arc<FilesystemInner>,
    cleanup: CleanupManager,
}

impl FilesystemStore {
    pub fn new(
        base: BaseStore,
        dir: impl Into<PathBuf>,
        cleanup_interval: Duration,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Configuration(format!(
                "cannot create session directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        info!(path = %dir.display(), provider = %base.provider_id(), "Using filesystem session store");
        Ok(Self {
            inner: Arc::new(FilesystemInner { base, dir }),
            cleanup: CleanupManager::new(cleanup_interval, DEFAULT_RUN_TIMEOUT),
        })
    }

    /// Start the periodic sweep
    pub fn start_cleanup(&self) -> bool {
        self.cleanup.start(self.inner.clone())
    }

    pub fn base(&self) -> &BaseStore {
        &self.inner.base
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Path of the advisory lock taken by cleanup
    pub fn lock_path(&self) -> PathBuf {
        self.inner.dir.join(LOCK_FILE)
    }
}

// ids are base64url; anything else could escape the directory
fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn encode_file(expires: i64, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXPIRY_LEN + payload.len());
    data.extend_from_slice(&expires.to_be_bytes());
    data.extend_from_slice(payload);
    data
}

fn decode_file(data: &[u8]) -> Option<(i64, &[u8])> {
    if data.len() < EXPIRY_LEN {
        return None;
    }
    let (expires, payload) = data.split_at(EXPIRY_LEN);
    Some((i64::from_be_bytes(expires.try_into().ok()?), payload))
}

impl FilesystemInner {
    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", FILE_PREFIX, id))
    }

    async fn load(&self, id: &str, name: &str) -> Result<Option<Session>, StoreError> {
        if !valid_id(id) {
            return Ok(None);
        }
        let data = match tokio::fs::read(self.session_path(id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(self.decode(id, name, &data))
    }

    fn decode(&self, id: &str, name: &str, data: &[u8]) -> Option<Session> {
        let (expires, payload) = decode_file(data)?;
        let now = Utc::now().timestamp();
        if expires <= now {
            debug!(provider = %self.base.provider_id(), "Session file expired");
            return None;
        }
        match self.base.serializer().deserialize(payload) {
            Ok(values) => {
                let mut options = self.base.options().clone();
                options.max_age = expires - now;
                Some(Session::restored(id, name, values, options))
            }
            Err(e) => {
                warn!(provider = %self.base.provider_id(), error = %e, "Discarding undecodable session file");
                None
            }
        }
    }

    async fn write(&self, session: &Session) -> Result<(), StoreError> {
        let expires = self.base.expiry(session.options.max_age).timestamp();
        let payload = self.base.serializer().serialize(&session.values)?;
        let path = self.session_path(session.id());
        let tmp = self
            .dir
            .join(format!("{}{}", TMP_PREFIX, BaseStore::generate_id()));
        let written = match tokio::fs::write(&tmp, encode_file(expires, &payload)).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn tombstone(&self, id: &str) -> Result<(), StoreError> {
        if !valid_id(id) {
            return Ok(());
        }
        let path = self.session_path(id);
        let mut tombstone = path.clone().into_os_string();
        tombstone.push(TOMBSTONE_SUFFIX);
        match tokio::fs::rename(&path, &tombstone).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_live(&self, name: &str) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(id) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix(FILE_PREFIX))
                .filter(|id| valid_id(id))
            else {
                continue;
            };
            let data = match tokio::fs::read(entry.path()).await {
                Ok(data) => data,
                // removed by a concurrent delete or sweep
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(session) = self.decode(id, name, &data) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn sweep(dir: &Path, max_age: i64) -> Result<CleanupOutcome, StoreError> {
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        match lock.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(StoreError::CleanupAlreadyRunning),
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        let result = Self::sweep_locked(dir, max_age);
        if let Err(e) = lock.unlock() {
            warn!(error = %e, "Failed to release cleanup lock");
        }
        result
    }

    fn sweep_locked(dir: &Path, max_age: i64) -> Result<CleanupOutcome, StoreError> {
        let now = Utc::now().timestamp();
        let max_age = Duration::from_secs(max_age.max(0) as u64);
        let mut removed = 0;

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let path = entry.path();
            let remove = if file_name.starts_with(TMP_PREFIX) {
                older_than(&path, TMP_RETENTION)
            } else if file_name.starts_with(FILE_PREFIX) {
                file_name.ends_with(TOMBSTONE_SUFFIX)
                    || older_than(&path, max_age)
                    || session_file_expired(&path, now)
            } else {
                false
            };
            if remove {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove session file"),
                }
            }
        }
        Ok(CleanupOutcome { removed })
    }
}

fn older_than(path: &Path, max_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}

fn session_file_expired(path: &Path, now: i64) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut header = [0u8; EXPIRY_LEN];
    use std::io::Read;
    match file.read_exact(&mut header) {
        Ok(()) => i64::from_be_bytes(header) <= now,
        Err(_) => true,
    }
}

#[async_trait]
impl CleanupTarget for FilesystemInner {
    fn label(&self) -> String {
        format!("filesystem:{}", self.base.provider_id())
    }

    async fn run_cleanup(&self) -> Result<CleanupOutcome, StoreError> {
        let dir = self.dir.clone();
        let max_age = self.base.options().max_age;
        let outcome = tokio::task::spawn_blocking(move || Self::sweep(&dir, max_age))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        if outcome.removed > 0 {
            info!(provider = %self.base.provider_id(), removed = outcome.removed, "Removed stale session files");
        }
        Ok(outcome)
    }
}

#[async_trait]
impl SessionStore for FilesystemStore {
    fn backend(&self) -> &'static str {
        "filesystem"
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
                        inner.tombstone(session.id()).await?;
                    }
                    return inner.base.expire_cookie(response, session);
                }
                if session.id().is_empty() {
                    session.assign_id(BaseStore::generate_id());
                }
                inner.write(session).await?;
                inner.base.write_session_cookie(response, session)
            })
            .await
    }

    async fn delete(&self, session: &Session) -> Result<(), StoreError> {
        self.inner
            .base
            .observe("delete", self.inner.tombstone(session.id()))
            .await
    }

    async fn get_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let name = String::new();
        self.inner
            .base
            .observe("get_all", self.inner.list_live(&name))
            .await
    }

    async fn cleanup(&self) -> Result<CleanupOutcome, StoreError> {
        self.inner
            .base
            .observe("cleanup", self.inner.run_cleanup())
            .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.cleanup.stop().await;
        Ok(())
    }
}
