#![allow(dead_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use jsonwebtoken::{EncodingKey, Header, encode};
use outpost::auth::{OutpostSettings, ProviderConfig, ProxyMode};
use outpost::config::OutpostConfig;
use outpost::server::ProxyServer;
use outpost::session::StorageConfig;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

pub const CLIENT_ID: &str = "outpost-client-0001";
pub const CLIENT_SECRET: &str = "outpost-client-secret";
pub const VALID_CODE: &str = "good-code";
pub const ACTIVE_TOKEN: &str = "live-token";
pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "correct horse";

#[derive(Clone)]
struct IdpState {
    issuer: String,
    introspections: Arc<AtomicUsize>,
}

/// Identity provider double issuing HS256 ID tokens signed with the client secret
pub struct MockIdp {
    addr: SocketAddr,
    introspections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockIdp {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let introspections = Arc::new(AtomicUsize::new(0));
        let state = IdpState {
            issuer: format!("http://{}/application/o/test/", addr),
            introspections: introspections.clone(),
        };

        let app = Router::new()
            .route("/application/o/token/", post(token))
            .route("/application/o/introspect/", post(introspect))
            .route("/application/o/test/jwks/", get(jwks))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            introspections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn issuer(&self) -> String {
        format!("{}/application/o/test/", self.base_url())
    }

    pub fn introspection_count(&self) -> usize {
        self.introspections.load(Ordering::SeqCst)
    }

    pub fn oidc(&self) -> Value {
        let base = self.base_url();
        json!({
            "issuer": self.issuer(),
            "authorization_endpoint": format!("{}/application/o/authorize/", base),
            "token_endpoint": format!("{}/application/o/token/", base),
            "userinfo_endpoint": format!("{}/application/o/userinfo/", base),
            "end_session_endpoint": format!("{}/application/o/test/end-session/", base),
            "jwks_uri": format!("{}/application/o/test/jwks/", base),
            "introspection_endpoint": format!("{}/application/o/introspect/", base),
        })
    }

    /// Provider configuration pointing at this identity provider
    pub fn provider(&self, name: &str, mode: ProxyMode, external_host: &str) -> ProviderConfig {
        serde_json::from_value(json!({
            "name": name,
            "provider_id": name,
            "mode": mode,
            "external_host": external_host,
            "internal_host": "http://127.0.0.1:1",
            "client_id": CLIENT_ID,
            "client_secret": CLIENT_SECRET,
            "cookie_secret": format!("{}-cookie-secret", name),
            "application_slug": name,
            "oidc": self.oidc(),
        }))
        .expect("valid provider config")
    }
}

impl Drop for MockIdp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn id_token(issuer: &str, sub: &str, username: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = json!({
        "iss": issuer,
        "aud": CLIENT_ID,
        "sub": sub,
        "iat": now,
        "exp": now + 3600,
        "email": format!("{}@example.com", username),
        "email_verified": true,
        "name": "Alice Example",
        "preferred_username": username,
        "groups": ["admins", "ops"],
        "sid": format!("sid-{}", sub),
        "ak_proxy": {
            "user_attributes": {"additionalHeaders": {"X-Tenant": "acme"}},
            "is_superuser": false
        }
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(CLIENT_SECRET.as_bytes()),
    )
    .expect("token encodes")
}

async fn token(
    State(state): State<IdpState>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    let grant = form.get("grant_type").map(String::as_str).unwrap_or_default();
    let authorized = match grant {
        "authorization_code" => {
            form.get("code").map(String::as_str) == Some(VALID_CODE)
                && form.get("client_secret").map(String::as_str) == Some(CLIENT_SECRET)
        }
        "password" => {
            form.get("username").map(String::as_str) == Some(USERNAME)
                && form.get("password").map(String::as_str) == Some(PASSWORD)
        }
        _ => false,
    };
    if !authorized {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "access_token": "access-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "id_token": id_token(&state.issuer, "u1", USERNAME),
        })),
    )
}

async fn introspect(
    State(state): State<IdpState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    state.introspections.fetch_add(1, Ordering::SeqCst);
    let authenticated = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Basic "));

    if !authenticated || form.get("token").map(String::as_str) != Some(ACTIVE_TOKEN) {
        return Json(json!({"active": false}));
    }
    Json(json!({
        "active": true,
        "sub": "svc-1",
        "exp": chrono::Utc::now().timestamp() + 600,
        "preferred_username": "svc-bot",
        "groups": ["robots"],
    }))
}

async fn jwks() -> Json<Value> {
    Json(json!({"keys": []}))
}

/// Upstream that echoes the request path and headers as JSON
pub async fn start_upstream() -> anyhow::Result<SocketAddr> {
    async fn echo(request: axum::extract::Request) -> Json<Value> {
        let headers: serde_json::Map<String, Value> = request
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), json!(value.to_str().unwrap_or_default())))
            .collect();
        Json(json!({"path": request.uri().to_string(), "headers": headers}))
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, Router::new().fallback(echo)).await;
    });
    Ok(addr)
}

/// Outpost served on an ephemeral port
pub struct TestOutpost {
    addr: SocketAddr,
    pub server: Arc<ProxyServer>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestOutpost {
    pub async fn start(
        providers: Vec<ProviderConfig>,
        storage: StorageConfig,
    ) -> anyhow::Result<Self> {
        let config = OutpostConfig {
            outpost: OutpostSettings {
                name: "test-outpost".to_string(),
                ..Default::default()
            },
            storage,
            providers,
            ..Default::default()
        };
        config.validate()?;
        let server = outpost::build_server(&config).await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = server.clone().router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            server,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.server.close().await;
    }
}

impl Drop for TestOutpost {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// HTTP client that leaves redirects to the test
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client builds")
}

/// Minimal browser cookie jar
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: HashMap<String, String>,
}

impl CookieJar {
    pub fn absorb(&mut self, response: &reqwest::Response) {
        for value in response.headers().get_all("set-cookie") {
            let Ok(text) = value.to_str() else { continue };
            let mut attributes = text.split(';');
            let Some((name, value)) = attributes.next().and_then(|pair| pair.split_once('=')) else {
                continue;
            };
            let expired = attributes.any(|attr| attr.trim().eq_ignore_ascii_case("Max-Age=0"));
            if expired || value.is_empty() {
                self.cookies.remove(name.trim());
            } else {
                self.cookies
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    pub fn header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

pub fn location(response: &reqwest::Response) -> url::Url {
    let value = response
        .headers()
        .get("location")
        .expect("location header")
        .to_str()
        .expect("ascii location");
    url::Url::parse(value).expect("absolute location")
}

pub fn query(url: &url::Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}
