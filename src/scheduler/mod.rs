//! Background cleanup scheduling for durable session stores.
//!
//! Every durable backend owns one [`CleanupManager`]. `start` spawns a single
//! worker loop that wakes on a fixed interval and sweeps the store; `stop`
//! signals the worker and waits for it to exit.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::{CleanupOutcome, StoreError};

/// Default time budget for one cleanup pass
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Something that can be swept periodically
#[async_trait]
pub trait CleanupTarget: Send + Sync + 'static {
    /// Label used in log lines
    fn label(&self) -> String;

    async fn run_cleanup(&self) -> Result<CleanupOutcome, StoreError>;
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Start/stop lifecycle around one periodic cleanup loop
pub struct CleanupManager {
    interval: Duration,
    run_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl CleanupManager {
    pub fn new(interval: Duration, run_timeout: Duration) -> Self {
        Self {
            interval,
            run_timeout,
            worker: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the worker. Returns false if one is already running.
    pub fn start(&self, target: Arc<dyn CleanupTarget>) -> bool {
        let mut guard = self.lock_worker();
        if guard.is_some() {
            debug!(target = %target.label(), "Cleanup worker already running");
            return false;
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run(target, self.interval, self.run_timeout, shutdown_rx));
        *guard = Some(Worker { shutdown, handle });
        true
    }

    /// Stop the worker and wait until it has exited
    pub async fn stop(&self) {
        let worker = self.lock_worker().take();
        let Some(worker) = worker else {
            return;
        };
        let _ = worker.shutdown.send(());
        if let Err(e) = worker.handle.await {
            warn!(error = %e, "Cleanup worker ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().is_some()
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Cleanup manager mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        if let Some(worker) = self.lock_worker().take() {
            let _ = worker.shutdown.send(());
            worker.handle.abort();
        }
    }
}

async fn run(
    target: Arc<dyn CleanupTarget>,
    interval: Duration,
    run_timeout: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let label = target.label();
    info!(target = %label, interval_secs = interval.as_secs(), "Cleanup worker started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut shutdown => break,
        }

        // the pass is dropped at its next await point when shutdown arrives
        tokio::select! {
            result = tokio::time::timeout(run_timeout, target.run_cleanup()) => {
                match result {
                    Ok(Ok(outcome)) => {
                        debug!(target = %label, removed = outcome.removed, "Cleanup pass finished");
                    }
                    Ok(Err(StoreError::CleanupAlreadyRunning)) => {
                        warn!(target = %label, "Previous cleanup still running; skipping this pass");
                    }
                    Ok(Err(e)) => {
                        warn!(target = %label, error = %e, "Cleanup pass failed");
                    }
                    Err(_) => {
                        warn!(target = %label, timeout_secs = run_timeout.as_secs(), "Cleanup pass timed out");
                    }
                }
            }
            _ = &mut shutdown => break,
        }
    }
    info!(target = %label, "Cleanup worker shutting down");
}
