// Relational Store Maintenance
// Batched hard deletion of expired and tombstoned rows, cleanup statistics
// and health reporting shared by the SQLite and Postgres backends

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use super::{CleanupOutcome, StoreError};

const BATCH_PAUSE: Duration = Duration::from_millis(10);

/// How aggressively old rows are removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    /// Rows removed per statement
    pub batch_size: i64,
    /// Tombstoned rows are kept this long before removal
    pub soft_delete_retention_days: i64,
    /// Expired rows are kept this long past their expiry
    pub expired_retention_hours: i64,
    /// Upper bound for one pass
    pub max_cleanup_secs: u64,
    /// Cumulative deletions after which space is reclaimed
    pub vacuum_threshold: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            soft_delete_retention_days: 30,
            expired_retention_hours: 24,
            max_cleanup_secs: 5 * 60,
            vacuum_threshold: 10_000,
        }
    }
}

impl CleanupPolicy {
    pub fn max_cleanup_duration(&self) -> Duration {
        Duration::from_secs(self.max_cleanup_secs)
    }

    /// Cutoffs for expired and tombstoned rows relative to `now`
    pub fn cutoffs(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            now - chrono::Duration::hours(self.expired_retention_hours),
            now - chrono::Duration::days(self.soft_delete_retention_days),
        )
    }
}

/// Figures from the most recent cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupStats {
    pub last_run: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub expired_deleted: u64,
    pub soft_deleted_cleaned: u64,
    pub total_processed: u64,
    pub error_count: u64,
    pub last_vacuum: Option<DateTime<Utc>>,
    pub vacuum_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub status: HealthStatus,
    pub connected: bool,
    pub error: Option<String>,
    pub cleanup: CleanupStats,
    pub deletions_since_vacuum: u64,
}

/// Row-level primitives a relational backend supplies to [`Housekeeper`]
#[async_trait]
pub trait BatchDelete: Send + Sync {
    /// Remove at most `limit` rows that expired before `cutoff`
    async fn delete_expired(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<u64, StoreError>;

    /// Remove at most `limit` rows tombstoned before `cutoff`
    async fn delete_soft_deleted(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, StoreError>;

    /// Reclaim free pages. Returns false when the backend has nothing to do.
    async fn vacuum(&self) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

struct Phase {
    deleted: u64,
    error: Option<StoreError>,
}

/// Runs cleanup passes and owns their statistics.
///
/// Only one pass runs at a time; a concurrent request gets
/// [`StoreError::CleanupAlreadyRunning`].
pub struct Housekeeper {
    label: String,
    policy: CleanupPolicy,
    stats: RwLock<CleanupStats>,
    deletions_since_vacuum: AtomicU64,
    running: Mutex<()>,
    closing: watch::Sender<bool>,
}

impl Housekeeper {
    pub fn new(label: impl Into<String>, policy: CleanupPolicy) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            label: label.into(),
            policy,
            stats: RwLock::new(CleanupStats::default()),
            deletions_since_vacuum: AtomicU64::new(0),
            running: Mutex::new(()),
            closing,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn policy(&self) -> &CleanupPolicy {
        &self.policy
    }

    /// Make any in-flight pass stop at its next batch boundary
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    pub async fn stats(&self) -> CleanupStats {
        self.stats.read().await.clone()
    }

    pub async fn run<B>(&self, backend: &B) -> Result<CleanupOutcome, StoreError>
    where
        B: BatchDelete + ?Sized,
    {
        let Ok(_running) = self.running.try_lock() else {
            return Err(StoreError::CleanupAlreadyRunning);
        };

        let started = Instant::now();
        let deadline = started + self.policy.max_cleanup_duration();
        let now = Utc::now();
        let (expired_cutoff, soft_delete_cutoff) = self.policy.cutoffs(now);

        let previous = self.stats().await;
        let mut stats = CleanupStats {
            last_run: Some(now),
            last_vacuum: previous.last_vacuum,
            vacuum_duration: previous.vacuum_duration,
            ..Default::default()
        };

        let expired = self
            .in_batches(deadline, |limit| backend.delete_expired(expired_cutoff, limit))
            .await;
        stats.expired_deleted = expired.deleted;
        if let Some(e) = expired.error {
            stats.error_count += 1;
            warn!(store = %self.label, error = %e, "Failed to remove expired sessions");
        }

        let soft_deleted = self
            .in_batches(deadline, |limit| {
                backend.delete_soft_deleted(soft_delete_cutoff, limit)
            })
            .await;
        stats.soft_deleted_cleaned = soft_deleted.deleted;
        if let Some(e) = soft_deleted.error {
            stats.error_count += 1;
            warn!(store = %self.label, error = %e, "Failed to remove soft-deleted sessions");
        }

        stats.total_processed = stats.expired_deleted + stats.soft_deleted_cleaned;
        let pending = self
            .deletions_since_vacuum
            .fetch_add(stats.total_processed, Ordering::SeqCst)
            + stats.total_processed;

        if pending >= self.policy.vacuum_threshold && !self.is_closing() {
            let vacuum_started = Instant::now();
            match backend.vacuum().await {
                Ok(true) => {
                    stats.last_vacuum = Some(Utc::now());
                    stats.vacuum_duration = vacuum_started.elapsed();
                    self.deletions_since_vacuum.store(0, Ordering::SeqCst);
                    info!(store = %self.label, duration_ms = stats.vacuum_duration.as_millis() as u64, "Database vacuum completed");
                }
                Ok(false) => {}
                Err(e) => {
                    stats.error_count += 1;
                    warn!(store = %self.label, error = %e, "Failed to vacuum database");
                }
            }
        }

        stats.duration = started.elapsed();
        info!(
            store = %self.label,
            expired_deleted = stats.expired_deleted,
            soft_deleted_cleaned = stats.soft_deleted_cleaned,
            error_count = stats.error_count,
            duration_ms = stats.duration.as_millis() as u64,
            "Cleanup completed"
        );
        let removed = stats.total_processed;
        *self.stats.write().await = stats;
        Ok(CleanupOutcome { removed })
    }

    async fn in_batches<F, Fut>(&self, deadline: Instant, mut batch: F) -> Phase
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = Result<u64, StoreError>>,
    {
        let limit = self.policy.batch_size.max(1);
        let mut deleted = 0;
        loop {
            if self.is_closing() {
                debug!(store = %self.label, "Store closing; stopping cleanup");
                return Phase { deleted, error: None };
            }
            if Instant::now() >= deadline {
                return Phase {
                    deleted,
                    error: Some(StoreError::Timeout("cleanup")),
                };
            }
            match batch(limit).await {
                Ok(count) => {
                    deleted += count;
                    if count < limit as u64 {
                        return Phase { deleted, error: None };
                    }
                }
                Err(e) => {
                    return Phase {
                        deleted,
                        error: Some(e),
                    };
                }
            }
            tokio::time::sleep(BATCH_PAUSE).await;
        }
    }

    pub async fn health<B>(&self, backend: &B) -> StoreHealth
    where
        B: BatchDelete + ?Sized,
    {
        let cleanup = self.stats().await;
        let (connected, error) = match backend.ping().await {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        let status = if !connected {
            HealthStatus::Unhealthy
        } else if cleanup.error_count > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        StoreHealth {
            status,
            connected,
            error,
            cleanup,
            deletions_since_vacuum: self.deletions_since_vacuum.load(Ordering::SeqCst),
        }
    }
}
