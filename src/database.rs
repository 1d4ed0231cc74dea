//! Credential-refreshing connection pool
//!
//! Wraps a shared pool handle so that an authentication failure (for example
//! after a database password rotation) triggers a reconnect with freshly
//! resolved credentials and a single retry of the failed operation.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::session::StoreError;

/// Produces the connection string from the current credentials
#[cfg_attr(test, mockall::automock)]
pub trait DsnSource: Send + Sync {
    fn dsn(&self) -> Result<String, StoreError>;
}

/// Fixed connection string, for callers that already hold a URL
#[derive(Debug, Clone)]
pub struct StaticDsn(pub String);

impl DsnSource for StaticDsn {
    fn dsn(&self) -> Result<String, StoreError> {
        Ok(self.0.clone())
    }
}

/// Opens and closes pool handles
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    async fn connect(&self, dsn: &str) -> Result<Self::Handle, StoreError>;

    async fn close(&self, _handle: Self::Handle) {}
}

struct Active<H> {
    handle: H,
    dsn: String,
    generation: u64,
}

/// What a refresh attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    Reconnected,
    /// Another task already swapped the handle
    AlreadyRefreshed,
    Unchanged,
}

pub struct RefreshablePool<C: Connector> {
    connector: C,
    source: Arc<dyn DsnSource>,
    active: RwLock<Active<C::Handle>>,
    reconnect: Mutex<()>,
}

impl<C: Connector> RefreshablePool<C> {
    /// Resolve credentials and open the initial handle
    pub async fn connect(connector: C, source: Arc<dyn DsnSource>) -> Result<Self, StoreError> {
        let dsn = source.dsn()?;
        let handle = connector.connect(&dsn).await?;
        Ok(Self {
            connector,
            source,
            active: RwLock::new(Active {
                handle,
                dsn,
                generation: 0,
            }),
            reconnect: Mutex::new(()),
        })
    }

    /// Current handle; the lock is released before the caller does any I/O
    pub async fn handle(&self) -> C::Handle {
        self.active.read().await.handle.clone()
    }

    pub async fn generation(&self) -> u64 {
        self.active.read().await.generation
    }

    /// Run `op`, reconnecting and retrying once on an authentication error
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(C::Handle) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let (handle, generation) = {
            let active = self.active.read().await;
            (active.handle.clone(), active.generation)
        };

        match op(handle).await {
            Err(err) if err.is_authentication() => {
                warn!(error = %err, "Database authentication failed; refreshing credentials");
                match self.refresh(generation).await {
                    Ok(Refresh::Unchanged) => Err(err),
                    Ok(_) => op(self.handle().await).await,
                    Err(refresh_err) => {
                        warn!(error = %refresh_err, "Credential refresh failed");
                        Err(err)
                    }
                }
            }
            other => other,
        }
    }

    /// Re-resolve credentials and reconnect if they changed since
    /// `observed_generation` was current.
    pub async fn refresh(&self, observed_generation: u64) -> Result<Refresh, StoreError> {
        let _guard = self.reconnect.lock().await;

        let (current_dsn, generation) = {
            let active = self.active.read().await;
            (active.dsn.clone(), active.generation)
        };
        if generation != observed_generation {
            debug!("Pool already reconnected by another task");
            return Ok(Refresh::AlreadyRefreshed);
        }

        let dsn = self.source.dsn()?;
        if dsn == current_dsn {
            debug!("Credentials unchanged; keeping current pool");
            return Ok(Refresh::Unchanged);
        }

        let handle = self.connector.connect(&dsn).await?;
        let previous = {
            let mut active = self.active.write().await;
            let previous = std::mem::replace(&mut active.handle, handle);
            active.dsn = dsn;
            active.generation += 1;
            previous
        };
        self.connector.close(previous).await;
        info!("Reconnected database pool with refreshed credentials");
        Ok(Refresh::Reconnected)
    }

    pub async fn close(&self) {
        let handle = self.handle().await;
        self.connector.close(handle).await;
    }
}
