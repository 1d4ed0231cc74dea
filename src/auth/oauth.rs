// OAuth2/OIDC Client
// Authorization-code flow, ID token verification and header-auth grants

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use super::config::ProviderConfig;
use super::endpoint::OidcEndpoints;
use super::error::AuthError;
use crate::claims::Claims;

/// Timeout applied to every request towards the identity provider
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub const SCOPES: &[&str] = &["openid", "email", "profile", "ak_proxy"];

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    pub id_token: Option<String>,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
}

/// OIDC relying party for one provider
pub struct OAuthClient {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    endpoints: OidcEndpoints,
    http: Client,
    jwks: RwLock<Option<JwkSet>>,
}

impl OAuthClient {
    pub fn new(
        config: &ProviderConfig,
        endpoints: OidcEndpoints,
        insecure: bool,
    ) -> Result<Self, AuthError> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| AuthError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.callback_url(),
            endpoints,
            http,
            jwks: RwLock::new(None),
        })
    }

    pub fn endpoints(&self) -> &OidcEndpoints {
        &self.endpoints
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Browser redirect to the authorization endpoint
    pub fn authorization_url(&self, state: &str) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.endpoints.authorize).map_err(|e| {
            AuthError::ConfigError(format!("Invalid authorization endpoint: {}", e))
        })?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &SCOPES.join(" "))
            .append_pair("state", state);

        Ok(url.to_string())
    }

    /// End-session redirect, with the ID token as hint when known
    pub fn end_session_url(&self, id_token_hint: Option<&str>) -> Option<String> {
        let mut url = Url::parse(&self.endpoints.end_session).ok()?;
        if let Some(hint) = id_token_hint.filter(|hint| !hint.is_empty()) {
            url.query_pairs_mut().append_pair("id_token_hint", hint);
        }
        Some(url.to_string())
    }

    fn backchannel(&self, url: &str) -> RequestBuilder {
        let request = self.http.post(url);
        match &self.endpoints.host_header {
            Some(host) => request.header(reqwest::header::HOST, host),
            None => request,
        }
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        self.token_request(&params).await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .backchannel(&self.endpoints.token)
            .form(params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::CodeExchangeFailed(format!(
                "Token endpoint returned {}: {}",
                status, body
            )));
        }

        Ok(response.json::<TokenResponse>().await?)
    }

    /// Exchange the code and verify the returned ID token
    pub async fn redeem(&self, code: &str) -> Result<Claims, AuthError> {
        let tokens = self.exchange_code(code).await?;
        let id_token = tokens.id_token.ok_or(AuthError::MissingIdToken)?;
        self.verify_id_token(&id_token).await
    }

    /// Verify signature, audience, issuer and expiry of an ID token
    pub async fn verify_id_token(&self, id_token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(id_token)?;

        let key = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                DecodingKey::from_secret(self.client_secret.as_bytes())
            }
            _ => self.jwk_key(header.kid.as_deref()).await?,
        };

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.client_id]);
        if !self.endpoints.issuer.is_empty() {
            validation.set_issuer(&[&self.endpoints.issuer]);
        }

        let mut claims = decode::<Claims>(id_token, &key, &validation)?.claims;
        claims.raw_token = id_token.to_string();
        Ok(claims)
    }

    async fn jwk_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        if let Some(key) = self.cached_key(kid).await? {
            return Ok(key);
        }

        // Unknown kid: keys may have rotated
        let keys = self.fetch_jwks().await?;
        let key = select_key(&keys, kid)?;
        *self.jwks.write().await = Some(keys);
        key.ok_or_else(|| AuthError::JwtError("No matching key in JWKS".to_string()))
    }

    async fn cached_key(&self, kid: Option<&str>) -> Result<Option<DecodingKey>, AuthError> {
        let cache = self.jwks.read().await;
        match cache.as_ref() {
            Some(keys) => select_key(keys, kid),
            None => Ok(None),
        }
    }

    async fn fetch_jwks(&self) -> Result<JwkSet, AuthError> {
        debug!(url = %self.endpoints.jwks, "Fetching JWKS");
        let mut request = self.http.get(&self.endpoints.jwks);
        if let Some(host) = &self.endpoints.host_header {
            request = request.header(reqwest::header::HOST, host);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AuthError::HttpError(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }
        Ok(response.json::<JwkSet>().await?)
    }

    /// Bearer fallback: token introspection
    pub async fn introspect(&self, token: &str) -> Result<Claims, AuthError> {
        let response = self
            .backchannel(&self.endpoints.introspection)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token)])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Token introspection failed");
            return Err(AuthError::InvalidCredentials);
        }

        let body = response.json::<serde_json::Value>().await?;
        let active = body
            .get("active")
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        if !active {
            return Err(AuthError::InactiveToken);
        }
        let mut claims: Claims = serde_json::from_value(body)?;
        claims.raw_token = token.to_string();
        Ok(claims)
    }

    /// Basic fallback: password grant, returning the verified ID token claims
    pub async fn password_grant(&self, username: &str, password: &str) -> Result<Claims, AuthError> {
        let scope = SCOPES.join(" ");
        let params = [
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("username", username),
            ("password", password),
            ("scope", scope.as_str()),
        ];
        let tokens = match self.token_request(&params).await {
            Ok(tokens) => tokens,
            Err(AuthError::CodeExchangeFailed(reason)) => {
                debug!(%reason, "Password grant rejected");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e),
        };
        let id_token = tokens.id_token.ok_or(AuthError::MissingIdToken)?;
        self.verify_id_token(&id_token).await
    }
}

fn select_key(keys: &JwkSet, kid: Option<&str>) -> Result<Option<DecodingKey>, AuthError> {
    let jwk = match kid {
        Some(kid) => keys.find(kid),
        None => keys.keys.first(),
    };
    jwk.map(DecodingKey::from_jwk)
        .transpose()
        .map_err(AuthError::from)
}
