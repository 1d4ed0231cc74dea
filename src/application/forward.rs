// Forward Auth Adapters
// Calling conventions of the edge proxies that delegate authentication

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, trace, warn};
use url::Url;

use super::routes::InternalRoute;
use super::{Application, OUTPOST_PREFIX, header_value, request_host, with_headers};
use crate::auth::AuthError;
use crate::error::errors;
use crate::middleware::extract_or_generate_request_id;

const AUTH_PREFIX: &str = "/outpost.goauthentik.io/auth/";
const ENVOY_PREFIX: &str = "/outpost.goauthentik.io/auth/envoy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardKind {
    Nginx,
    Traefik,
    Caddy,
    Envoy,
}

impl ForwardKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(AUTH_PREFIX)?;
        match rest {
            "nginx" => Some(ForwardKind::Nginx),
            "traefik" => Some(ForwardKind::Traefik),
            "caddy" => Some(ForwardKind::Caddy),
            _ if rest == "envoy" || rest.starts_with("envoy/") => Some(ForwardKind::Envoy),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.adapter().name()
    }

    pub fn adapter(&self) -> &'static dyn ForwardAdapter {
        match self {
            ForwardKind::Nginx => &NginxAdapter,
            ForwardKind::Traefik => &TraefikAdapter,
            ForwardKind::Caddy => &CaddyAdapter,
            ForwardKind::Envoy => &EnvoyAdapter,
        }
    }
}

/// How one edge proxy describes the original request and expects a denial
#[async_trait]
pub trait ForwardAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// URL the client originally requested
    fn original_url(&self, app: &Application, headers: &HeaderMap, uri: &Uri) -> Option<Url>;

    /// Whether outpost paths in the original URL are answered here
    fn serves_outpost_paths(&self) -> bool {
        true
    }

    /// Response when the caller is not authenticated
    async fn unauthenticated(
        &self,
        app: &Application,
        headers: &HeaderMap,
        response: HeaderMap,
        original: &Url,
    ) -> Result<Response, AuthError> {
        app.redirect_to_start(headers, response, original).await
    }
}

/// `X-Forwarded-Proto`, `X-Forwarded-Host` and `X-Forwarded-Uri`
fn forwarded_url(app: &Application, headers: &HeaderMap) -> Option<Url> {
    let scheme = header_value(headers, "x-forwarded-proto")
        .unwrap_or_else(|| app.external_url().scheme().to_string());
    let host = request_host(headers)?;
    let uri = header_value(headers, "x-forwarded-uri").unwrap_or_else(|| "/".to_string());
    Url::parse(&format!("{}://{}{}", scheme, host, uri)).ok()
}

pub struct NginxAdapter;

#[async_trait]
impl ForwardAdapter for NginxAdapter {
    fn name(&self) -> &'static str {
        "nginx"
    }

    fn original_url(&self, app: &Application, headers: &HeaderMap, _uri: &Uri) -> Option<Url> {
        if let Some(original_uri) = header_value(headers, "x-original-uri") {
            let scheme = header_value(headers, "x-forwarded-proto")
                .unwrap_or_else(|| app.external_url().scheme().to_string());
            let host = request_host(headers)?;
            return Url::parse(&format!("{}://{}{}", scheme, host, original_uri)).ok();
        }
        Url::parse(&header_value(headers, "x-original-url")?).ok()
    }

    fn serves_outpost_paths(&self) -> bool {
        false
    }

    /// nginx turns the 401 into a redirect itself; remember where to return
    async fn unauthenticated(
        &self,
        app: &Application,
        headers: &HeaderMap,
        mut response: HeaderMap,
        original: &Url,
    ) -> Result<Response, AuthError> {
        let mut session = app.store.get(headers, &app.cookie_name).await?;
        if session.redirect().is_none() {
            session.set_redirect(original.to_string());
            app.store.save(headers, &mut response, &mut session).await?;
        }
        Ok(with_headers(StatusCode::UNAUTHORIZED, response))
    }
}

pub struct TraefikAdapter;

#[async_trait]
impl ForwardAdapter for TraefikAdapter {
    fn name(&self) -> &'static str {
        "traefik"
    }

    fn original_url(&self, app: &Application, headers: &HeaderMap, _uri: &Uri) -> Option<Url> {
        forwarded_url(app, headers)
    }
}

pub struct CaddyAdapter;

#[async_trait]
impl ForwardAdapter for CaddyAdapter {
    fn name(&self) -> &'static str {
        "caddy"
    }

    fn original_url(&self, app: &Application, headers: &HeaderMap, _uri: &Uri) -> Option<Url> {
        forwarded_url(app, headers)
    }
}

pub struct EnvoyAdapter;

#[async_trait]
impl ForwardAdapter for EnvoyAdapter {
    fn name(&self) -> &'static str {
        "envoy"
    }

    /// ext_authz appends the original path to the check path
    fn original_url(&self, app: &Application, headers: &HeaderMap, uri: &Uri) -> Option<Url> {
        let path = uri.path().strip_prefix(ENVOY_PREFIX).unwrap_or("/");
        let path = if path.is_empty() { "/" } else { path };
        let query = uri.query().map(|q| format!("?{}", q)).unwrap_or_default();
        let scheme = header_value(headers, "x-forwarded-proto")
            .unwrap_or_else(|| app.external_url().scheme().to_string());
        let host = header_value(headers, header::HOST.as_str())?;
        Url::parse(&format!("{}://{}{}{}", scheme, host, path, query)).ok()
    }
}

/// Answer a forward-auth check
pub(crate) async fn serve(
    app: &Application,
    kind: ForwardKind,
    request: Request<Body>,
) -> Result<Response, AuthError> {
    let adapter = kind.adapter();
    let (parts, _body) = request.into_parts();
    trace!(adapter = adapter.name(), headers = ?parts.headers, "Forward auth headers");

    let Some(original) = adapter.original_url(app, &parts.headers, &parts.uri) else {
        warn!(provider = %app.name(), adapter = adapter.name(), "No original URL on forward auth request");
        let request_id = extract_or_generate_request_id(&parts.headers);
        return Ok(errors::bad_request(
            "Missing original URL headers",
            parts.uri.path(),
            &request_id,
        )
        .into_response());
    };

    if adapter.serves_outpost_paths()
        && original.path().starts_with(OUTPOST_PREFIX)
        && let Some(route) = InternalRoute::from_path(original.path())
    {
        return app.serve_internal(route, &parts.headers, &original).await;
    }

    let mut response = HeaderMap::new();
    if let Some(claims) = app.check_auth(&parts.headers, &mut response).await? {
        app.add_headers(&mut response, &claims);
        if let Some(agent) = parts.headers.get(header::USER_AGENT) {
            response.insert(header::USER_AGENT, agent.clone());
        }
        return Ok(with_headers(StatusCode::OK, response));
    }

    if app.is_allowlisted(&original) {
        debug!(provider = %app.name(), url = %original, "Path can be accessed without authentication");
        return Ok(with_headers(StatusCode::OK, response));
    }

    adapter
        .unauthenticated(app, &parts.headers, response, &original)
        .await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::auth::ProxyMode;
    use crate::claims::Claims;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    fn request(path: &str, headers: HeaderMap) -> Request<Body> {
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        *request.headers_mut() = headers;
        request
    }

    #[test]
    fn test_kind_from_path() {
        assert_eq!(
            ForwardKind::from_path("/outpost.goauthentik.io/auth/nginx"),
            Some(ForwardKind::Nginx)
        );
        assert_eq!(
            ForwardKind::from_path("/outpost.goauthentik.io/auth/caddy"),
            Some(ForwardKind::Caddy)
        );
        assert_eq!(
            ForwardKind::from_path("/outpost.goauthentik.io/auth/envoy/app/page"),
            Some(ForwardKind::Envoy)
        );
        assert_eq!(ForwardKind::from_path("/outpost.goauthentik.io/auth/haproxy"), None);
        assert_eq!(ForwardKind::Traefik.name(), "traefik");
    }

    #[test]
    fn test_original_urls() {
        let app = application(provider(ProxyMode::ForwardSingle));
        let uri: Uri = "/outpost.goauthentik.io/auth/nginx".parse().unwrap();

        let nginx = headers(&[("x-original-url", "https://grafana.example.com/d/1?x=2")]);
        assert_eq!(
            NginxAdapter.original_url(&app, &nginx, &uri).unwrap().as_str(),
            "https://grafana.example.com/d/1?x=2"
        );
        let nginx = headers(&[
            ("x-original-uri", "/d/1"),
            ("x-forwarded-host", "grafana.example.com"),
        ]);
        assert_eq!(
            NginxAdapter.original_url(&app, &nginx, &uri).unwrap().as_str(),
            "https://grafana.example.com/d/1"
        );
        assert!(NginxAdapter.original_url(&app, &HeaderMap::new(), &uri).is_none());

        let traefik = headers(&[
            ("x-forwarded-proto", "http"),
            ("x-forwarded-host", "grafana.example.com"),
            ("x-forwarded-uri", "/explore?left=1"),
        ]);
        assert_eq!(
            TraefikAdapter.original_url(&app, &traefik, &uri).unwrap().as_str(),
            "http://grafana.example.com/explore?left=1"
        );

        let envoy_uri: Uri = "/outpost.goauthentik.io/auth/envoy/explore?left=1".parse().unwrap();
        let envoy = headers(&[("host", "grafana.example.com")]);
        assert_eq!(
            EnvoyAdapter.original_url(&app, &envoy, &envoy_uri).unwrap().as_str(),
            "https://grafana.example.com/explore?left=1"
        );
    }

    #[tokio::test]
    async fn test_nginx_denies_with_401_and_remembers_target() {
        let app = application(provider(ProxyMode::ForwardSingle));
        let response = app
            .handle(request(
                "/outpost.goauthentik.io/auth/nginx",
                headers(&[("x-original-url", "https://grafana.example.com/d/1")]),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let session = app
            .store()
            .get(&replay(response.headers()), app.cookie_name())
            .await
            .unwrap();
        assert_eq!(session.redirect(), Some("https://grafana.example.com/d/1"));
    }

    #[tokio::test]
    async fn test_traefik_redirects_to_start() {
        let app = application(provider(ProxyMode::ForwardSingle));
        let response = app
            .handle(request(
                "/outpost.goauthentik.io/auth/traefik",
                headers(&[
                    ("x-forwarded-proto", "https"),
                    ("x-forwarded-host", "grafana.example.com"),
                    ("x-forwarded-uri", "/d/1"),
                ]),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert!(location.starts_with("https://grafana.example.com/outpost.goauthentik.io/start?rd="));
    }

    #[tokio::test]
    async fn test_caddy_serves_outpost_paths() {
        let app = application(provider(ProxyMode::ForwardSingle));
        let response = app
            .handle(request(
                "/outpost.goauthentik.io/auth/caddy",
                headers(&[
                    ("x-forwarded-host", "grafana.example.com"),
                    ("x-forwarded-uri", "/outpost.goauthentik.io/start?rd=%2Fd%2F1"),
                ]),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers().get(header::LOCATION).unwrap().to_str().unwrap();
        assert!(location.starts_with("https://idp.example.com/application/o/authorize/"));
    }

    #[tokio::test]
    async fn test_allowlisted_path_passes_without_session() {
        let mut config = provider(ProxyMode::ForwardSingle);
        config.skip_path_regex = "^/public/".to_string();
        let app = application(config);
        let response = app
            .handle(request(
                "/outpost.goauthentik.io/auth/envoy/public/logo.png",
                headers(&[("host", "grafana.example.com")]),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-authentik-uid").is_none());
    }

    #[tokio::test]
    async fn test_authenticated_request_gets_identity_headers() {
        let app = application(provider(ProxyMode::ForwardDomain));
        let mut cookies = HeaderMap::new();
        app.save_claims(
            &HeaderMap::new(),
            &mut cookies,
            &Claims {
                sub: "u1".into(),
                preferred_username: "alice".into(),
                exp: chrono::Utc::now().timestamp() + 600,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut request_headers = replay(&cookies);
        request_headers.insert("x-forwarded-host", HeaderValue::from_static("wiki.example.com"));
        request_headers.insert("x-forwarded-uri", HeaderValue::from_static("/"));
        request_headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));

        let response = app
            .handle(request("/outpost.goauthentik.io/auth/traefik", request_headers))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-authentik-uid"], "u1");
        assert_eq!(response.headers()["x-authentik-username"], "alice");
        assert_eq!(response.headers()[header::USER_AGENT], "curl/8");
    }

    #[tokio::test]
    async fn test_missing_forward_headers_is_a_bad_request() {
        let app = application(provider(ProxyMode::ForwardSingle));
        let response = app
            .handle(request("/outpost.goauthentik.io/auth/nginx", HeaderMap::new()))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
