use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Aggregated statistics for one operation on one backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub count: u64,
    pub errors: u64,
    pub total_duration: Duration,
}

/// Per-operation, per-backend duration and count
#[derive(Debug, Default)]
pub struct StoreMetrics {
    operations: Mutex<HashMap<(&'static str, &'static str), OperationStats>>,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, backend: &'static str, operation: &'static str, elapsed: Duration, ok: bool) {
        let mut guard = self.lock();
        let entry = guard.entry((backend, operation)).or_default();
        entry.count += 1;
        entry.total_duration += elapsed;
        if !ok {
            entry.errors += 1;
        }
        drop(guard);

        debug!(
            backend,
            operation,
            elapsed_ms = elapsed.as_millis() as u64,
            ok,
            "Session store operation"
        );
    }

    pub fn get(&self, backend: &'static str, operation: &'static str) -> OperationStats {
        self.lock()
            .get(&(backend, operation))
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> HashMap<(&'static str, &'static str), OperationStats> {
        self.lock().clone()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(&'static str, &'static str), OperationStats>> {
        match self.operations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Store metrics mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}
