// Application
// Per-provider authentication state machine behind the front door

pub mod auth;
pub mod forward;
pub mod headers;
pub mod proxy;
pub mod redirect;
pub mod routes;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

use crate::auth::{
    AuthError, OAuthClient, OidcEndpoints, OutpostSettings, ProviderConfig, ProxyMode,
    StateSigner,
};
use crate::error::errors;
use crate::middleware::extract_or_generate_request_id;
use crate::session::{SessionFilter, SessionStore, StorageConfig, build_session_store};

use self::auth::HeaderAuthCache;
use self::forward::ForwardKind;
use self::routes::InternalRoute;

/// Path prefix of the outpost's own endpoints
pub const OUTPOST_PREFIX: &str = "/outpost.goauthentik.io";
/// Prefix used by older deployments
pub const LEGACY_PREFIX: &str = "/akprox";

/// One provider with its session store and OIDC client
pub struct Application {
    config: ProviderConfig,
    outpost: OutpostSettings,
    cookie_name: String,
    external_url: Url,
    external_authority: String,
    skip_patterns: Vec<Regex>,
    store: Arc<dyn SessionStore>,
    oauth: OAuthClient,
    signer: StateSigner,
    header_cache: HeaderAuthCache,
    upstream: Option<reqwest::Client>,
}

impl Application {
    /// Build the application and its configured session store
    pub async fn new(
        config: ProviderConfig,
        outpost: &OutpostSettings,
        storage: &StorageConfig,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let store = build_session_store(
            storage,
            &config.provider_id,
            &config.cookie_secret,
            config.session_options(),
        )
        .await?;
        Self::with_store(config, outpost, store)
    }

    /// Build the application around an existing store
    pub fn with_store(
        config: ProviderConfig,
        outpost: &OutpostSettings,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let endpoints = OidcEndpoints::resolve(&config.oidc, outpost)?;
        let oauth = OAuthClient::new(&config, endpoints, outpost.authentik_insecure)?;
        let upstream = match config.mode {
            ProxyMode::Proxy => Some(proxy::upstream_client(&config)?),
            _ => None,
        };

        Ok(Self {
            cookie_name: config.cookie_name(),
            external_url: config.external_url()?,
            external_authority: config.external_authority()?,
            skip_patterns: config.skip_path_patterns()?,
            signer: StateSigner::new(&config.client_id, &config.cookie_secret),
            header_cache: HeaderAuthCache::default(),
            outpost: outpost.clone(),
            store,
            oauth,
            upstream,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    pub fn mode(&self) -> ProxyMode {
        self.config.mode
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn external_url(&self) -> &Url {
        &self.external_url
    }

    /// Host (with non-default port) the application is served on
    pub fn external_authority(&self) -> &str {
        &self.external_authority
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    /// Cookie domain without its leading dot
    pub(crate) fn cookie_domain(&self) -> &str {
        self.config.cookie_domain.trim_start_matches('.')
    }

    /// Handle one request addressed to this application
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let request_id = extract_or_generate_request_id(request.headers());
        let path = request.uri().path().to_string();

        match self.route(request).await {
            Ok(response) => response,
            Err(e) => {
                if e.status_code() >= 500 {
                    error!(provider = %self.config.name, path = %path, request_id = %request_id, error = %e, "Request failed");
                } else {
                    warn!(provider = %self.config.name, path = %path, request_id = %request_id, error = %e, "Request rejected");
                }
                errors::from_auth(&e, &path, &request_id).into_response()
            }
        }
    }

    async fn route(&self, request: Request<Body>) -> Result<Response, AuthError> {
        let path = request.uri().path();

        if self.config.mode.is_forward()
            && let Some(kind) = ForwardKind::from_path(path)
        {
            debug!(provider = %self.config.name, adapter = kind.name(), "Forward auth request");
            return forward::serve(self, kind, request).await;
        }

        if let Some(route) = InternalRoute::from_path(path) {
            let url = self.request_url(request.headers(), request.uri());
            return self.serve_internal(route, request.headers(), &url).await;
        }

        match self.config.mode {
            ProxyMode::Proxy => self.proxy(request).await,
            _ => {
                let request_id = extract_or_generate_request_id(request.headers());
                Ok(errors::not_found(request.uri().path(), &request_id).into_response())
            }
        }
    }

    /// Absolute URL of the request as the browser sees it
    pub(crate) fn request_url(&self, headers: &HeaderMap, uri: &Uri) -> Url {
        let scheme = header_value(headers, "x-forwarded-proto")
            .unwrap_or_else(|| self.external_url.scheme().to_string());
        let host = request_host(headers).unwrap_or_else(|| self.external_authority.clone());
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        Url::parse(&format!("{}://{}{}", scheme, host, path))
            .unwrap_or_else(|_| self.external_url.clone())
    }

    /// Sign out every session of this provider matching `filter`
    pub async fn logout(&self, filter: &SessionFilter) -> Result<u64, AuthError> {
        let removed = self.store.logout_sessions(filter).await?;
        self.header_cache.evict(|claims| filter.matches(claims));
        debug!(provider = %self.config.name, ?filter, removed, "Logged out sessions");
        Ok(removed)
    }

    /// Stop background work and release the store
    pub async fn close(&self) -> Result<(), AuthError> {
        self.store.close().await?;
        Ok(())
    }
}

/// First value of a possibly comma separated header
pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Host the client addressed, preferring `X-Forwarded-Host`
pub fn request_host(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "x-forwarded-host")
        .or_else(|| header_value(headers, header::HOST.as_str()))
}

/// 302 to `location`, carrying `headers` (usually Set-Cookie)
pub(crate) fn redirect_response(location: &str, headers: HeaderMap) -> Response {
    let mut response = with_headers(StatusCode::FOUND, headers);
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

pub(crate) fn with_headers(status: StatusCode, headers: HeaderMap) -> Response {
    let mut response = status.into_response();
    response.headers_mut().extend(headers);
    response
}
