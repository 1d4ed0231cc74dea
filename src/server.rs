// Proxy Front Door
// Selects the application for a request by host and serves it

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_server::{Handle, Server};
use futures_util::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::application::routes::InternalRoute;
use crate::application::{Application, request_host};
use crate::auth::{AuthError, ProxyMode};
use crate::error::errors;
use crate::middleware::{extract_or_generate_request_id, request_id_middleware};
use crate::session::SessionFilter;

/// PEM encoded certificate chain and private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

/// Time in-flight requests get to finish after shutdown is requested
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Supplies certificates by server name
pub trait CertificateResolver: Send + Sync {
    fn resolve(&self, server_name: &str) -> Option<ServerCertificate>;
}

/// Host-dispatching front door over all configured applications
pub struct ProxyServer {
    apps: RwLock<HashMap<String, Arc<Application>>>,
    certificates: Option<Arc<dyn CertificateResolver>>,
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyServer {
    pub fn new() -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            certificates: None,
        }
    }

    pub fn with_certificates(mut self, resolver: Arc<dyn CertificateResolver>) -> Self {
        self.certificates = Some(resolver);
        self
    }

    /// Replace the served applications, closing the ones no longer in use
    pub async fn set_providers(&self, applications: Vec<Application>) {
        let next: HashMap<String, Arc<Application>> = applications
            .into_iter()
            .map(|app| (app.external_authority().to_ascii_lowercase(), Arc::new(app)))
            .collect();
        info!(count = next.len(), "Updating providers");

        let previous = {
            let mut apps = self.apps.write().await;
            std::mem::replace(&mut *apps, next)
        };

        close_all(previous.into_values()).await;
    }

    /// Application serving `host`
    ///
    /// Exact authority first, then the host without port, then a
    /// forward_domain application whose cookie domain covers the host.
    pub async fn lookup(&self, host: &str) -> Option<Arc<Application>> {
        let host = host.to_ascii_lowercase();
        let apps = self.apps.read().await;
        if let Some(app) = apps.get(&host) {
            return Some(app.clone());
        }
        let bare = strip_port(&host);
        if let Some(app) = apps.get(bare) {
            return Some(app.clone());
        }
        apps.values()
            .filter(|app| app.mode() == ProxyMode::ForwardDomain)
            .find(|app| {
                let domain = app.config().cookie_domain.trim_start_matches('.');
                !domain.is_empty()
                    && (bare == domain || bare.ends_with(&format!(".{}", domain)))
            })
            .cloned()
    }

    pub async fn applications(&self) -> Vec<Arc<Application>> {
        self.apps.read().await.values().cloned().collect()
    }

    /// Certificate for a TLS handshake naming `server_name`
    pub async fn certificate_for(&self, server_name: &str) -> Option<ServerCertificate> {
        let resolver = self.certificates.as_ref()?;
        if self.lookup(server_name).await.is_none() {
            debug!(server_name, "No provider for TLS server name");
        }
        resolver.resolve(server_name)
    }

    /// Sign out matching sessions across every provider
    pub async fn logout(&self, filter: &SessionFilter) -> Result<u64, AuthError> {
        let apps = self.applications().await;
        let removed = try_join_all(apps.iter().map(|app| app.logout(filter))).await?;
        Ok(removed.into_iter().sum())
    }

    /// Close every provider's session store
    pub async fn close(&self) {
        let previous = std::mem::take(&mut *self.apps.write().await);
        close_all(previous.into_values()).await;
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(dispatch)
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Listen on `addr` until `shutdown` fires
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let handle: Handle<SocketAddr> = Handle::new();
        self.serve_with_handle(addr, handle, shutdown).await
    }

    /// [`serve`](Self::serve) driving `handle`, which reports the bound address
    ///
    /// On shutdown, in-flight requests get [`SHUTDOWN_GRACE`] to finish
    /// before the session stores are closed.
    pub async fn serve_with_handle(
        self: Arc<Self>,
        addr: SocketAddr,
        handle: Handle<SocketAddr>,
        shutdown: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let app = self.clone().router();
        info!("listening on {}", addr);

        let signal = handle.clone();
        let watcher = tokio::spawn(async move {
            if shutdown.await.is_ok() {
                info!("Shutdown requested, draining connections");
                signal.graceful_shutdown(Some(SHUTDOWN_GRACE));
            }
        });

        let result = Server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await;
        watcher.abort();

        self.close().await;
        result?;
        Ok(())
    }
}

async fn close_all(apps: impl Iterator<Item = Arc<Application>>) {
    join_all(apps.map(|app| async move {
        debug!(provider = %app.name(), "Closing provider");
        if let Err(e) = app.close().await {
            warn!(provider = %app.name(), error = %e, "Failed to close session store");
        }
    }))
    .await;
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map(|(h, _)| &host[..h.len() + 1]).unwrap_or(host);
    }
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

async fn dispatch(State(server): State<Arc<ProxyServer>>, request: Request<Body>) -> Response {
    if InternalRoute::from_path(request.uri().path()) == Some(InternalRoute::Ping) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let host = request_host(request.headers())
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();

    match server.lookup(&host).await {
        Some(app) => app.handle(request).await,
        None => {
            let request_id = extract_or_generate_request_id(request.headers());
            warn!(%host, path = %request.uri().path(), "No provider for host");
            errors::unknown_host(&host, request.uri().path(), &request_id).into_response()
        }
    }
}
