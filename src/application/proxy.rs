// Reverse Proxy
// Forwards authenticated requests to the internal host

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, header};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{Application, request_host};
use crate::auth::{AuthError, ProviderConfig};
use crate::claims::Claims;
use crate::error::errors;
use crate::middleware::extract_or_generate_request_id;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Headers that apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP client towards the internal host
pub(crate) fn upstream_client(config: &ProviderConfig) -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(!config.internal_host_ssl_validation)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .build()
        .map_err(|e| AuthError::ConfigError(format!("Failed to create upstream client: {}", e)))
}

/// Remove hop-by-hop headers, including those named by `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in HOP_BY_HOP.iter().copied().map(str::to_string).chain(named) {
        headers.remove(name.as_str());
    }
}

/// `base` with the request's path and query appended
pub(crate) fn upstream_url(base: &Url, path_and_query: &str) -> Result<Url, AuthError> {
    let base_path = base.path().trim_end_matches('/');
    let target = format!(
        "{}://{}{}{}",
        base.scheme(),
        authority(base),
        base_path,
        path_and_query
    );
    Url::parse(&target)
        .map_err(|e| AuthError::HttpError(format!("Invalid upstream URL {}: {}", target, e)))
}

fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

impl Application {
    /// Upstream base for `claims`, honouring a backend override
    fn upstream_base(&self, claims: &Claims) -> Result<Url, AuthError> {
        if let Some(backend) = claims.proxy.backend_override.as_deref()
            && let Ok(url) = Url::parse(backend)
            && url.host_str().is_some()
        {
            debug!(provider = %self.config.name, backend = %url, "Using backend override");
            return Ok(url);
        }
        self.config.internal_url()
    }

    /// Authenticate and forward the request to the upstream
    pub(crate) async fn proxy(&self, request: Request<Body>) -> Result<Response, AuthError> {
        let (parts, body) = request.into_parts();
        let mut cookies = HeaderMap::new();
        let claims = self.check_auth(&parts.headers, &mut cookies).await?;

        let claims = match claims {
            Some(claims) => Some(claims),
            None => {
                let url = self.request_url(&parts.headers, &parts.uri);
                if !self.is_allowlisted(&url) {
                    return self.redirect_to_start(&parts.headers, cookies, &url).await;
                }
                None
            }
        };

        let Some(client) = self.upstream.as_ref() else {
            return Err(AuthError::ConfigError(
                "Upstream client is not configured".to_string(),
            ));
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let base = match claims.as_ref() {
            Some(claims) => self.upstream_base(claims)?,
            None => self.config.internal_url()?,
        };
        let target = upstream_url(&base, path_and_query)?;

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        self.strip_identity_headers(&mut headers);
        if let Some(claims) = claims.as_ref() {
            self.add_headers(&mut headers, claims);
        }

        let original_host = request_host(&parts.headers);
        if let Some(host) = original_host.as_deref()
            && let Ok(value) = HeaderValue::from_str(host)
        {
            headers.insert(HeaderName::from_static("x-forwarded-host"), value);
        }
        if !headers.contains_key("x-forwarded-proto")
            && let Ok(value) = HeaderValue::from_str(self.external_url.scheme())
        {
            headers.insert(HeaderName::from_static("x-forwarded-proto"), value);
        }
        let host_override = claims
            .as_ref()
            .and_then(|claims| claims.proxy.host_header.clone())
            .filter(|host| !host.is_empty());
        match host_override.or(original_host) {
            Some(host) => {
                if let Ok(value) = HeaderValue::from_str(&host) {
                    headers.insert(header::HOST, value);
                }
            }
            None => {
                headers.remove(header::HOST);
            }
        }

        debug!(provider = %self.config.name, method = %parts.method, upstream = %target, "Proxying request");
        let upstream = client
            .request(parts.method.clone(), target.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(provider = %self.config.name, upstream = %target, error = %e, "Upstream request failed");
                let request_id = extract_or_generate_request_id(&parts.headers);
                let mut response =
                    errors::bad_gateway(parts.uri.path(), &request_id).into_response();
                response.headers_mut().extend(cookies);
                return Ok(response);
            }
        };

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response.headers_mut().insert(
            HeaderName::from_static("x-powered-by"),
            HeaderValue::from_static("goauthentik.io"),
        );
        for value in cookies.get_all(header::SET_COOKIE) {
            response
                .headers_mut()
                .append(header::SET_COOKIE, value.clone());
        }
        Ok(response)
    }
}
