// Authentication Checks
// Session claims first, then Bearer/Basic credentials on the Authorization header

use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use super::Application;
use crate::auth::AuthError;
use crate::claims::Claims;

/// Lifetime of cached header claims without an expiry
const DEFAULT_CACHE_TTL_SECS: i64 = 300;
const MAX_CACHE_ENTRIES: usize = 4096;

struct CachedClaims {
    claims: Claims,
    expires: i64,
}

type CacheKey = [u8; 32];

/// Claims resolved from an Authorization header, keyed by a SHA-256 digest
/// of the header value so credentials are never held in memory
#[derive(Default)]
pub struct HeaderAuthCache {
    entries: RwLock<HashMap<CacheKey, CachedClaims>>,
}

fn cache_key(authorization: &str) -> CacheKey {
    Sha256::digest(authorization.as_bytes()).into()
}

impl HeaderAuthCache {
    pub fn get(&self, authorization: &str) -> Option<Claims> {
        let now = chrono::Utc::now().timestamp();
        let entries = self.entries.read().ok()?;
        entries
            .get(&cache_key(authorization))
            .filter(|entry| entry.expires > now)
            .map(|entry| entry.claims.clone())
    }

    /// Cache until the claims expire
    pub fn insert(&self, authorization: &str, claims: Claims) {
        let now = chrono::Utc::now().timestamp();
        let expires = if claims.exp > 0 {
            claims.exp
        } else {
            now + DEFAULT_CACHE_TTL_SECS
        };
        if expires <= now {
            return;
        }
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= MAX_CACHE_ENTRIES {
            entries.retain(|_, entry| entry.expires > now);
        }
        entries.insert(cache_key(authorization), CachedClaims { claims, expires });
    }

    pub fn evict(&self, matches: impl Fn(&Claims) -> bool) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, entry| !matches(&entry.claims));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split a Basic credential into user and password
pub fn decode_basic(value: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(value.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

impl Application {
    /// Claims of the caller, if authenticated
    ///
    /// Header credentials that verify are written into the session, so
    /// `response` may receive a Set-Cookie.
    pub async fn check_auth(
        &self,
        headers: &HeaderMap,
        response: &mut HeaderMap,
    ) -> Result<Option<Claims>, AuthError> {
        if let Some(claims) = self.claims_from_session(headers).await? {
            return Ok(Some(claims));
        }

        if !self.config.intercept_header_auth {
            return Ok(None);
        }
        let Some(authorization) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
        else {
            return Ok(None);
        };

        if let Some(claims) = self.header_cache.get(authorization) {
            return Ok(Some(claims));
        }

        let Some(claims) = self.authenticate_header(authorization).await else {
            return Ok(None);
        };
        self.save_claims(headers, response, &claims).await?;
        self.header_cache
            .insert(authorization, claims.clone());
        Ok(Some(claims))
    }

    /// Unexpired claims stored in the request's session
    pub(crate) async fn claims_from_session(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Claims>, AuthError> {
        let session = self.store.get(headers, &self.cookie_name).await?;
        Ok(session.claims().filter(|claims| !claims.is_expired()))
    }

    async fn authenticate_header(&self, authorization: &str) -> Option<Claims> {
        let (scheme, value) = authorization.split_once(' ')?;
        let result = match scheme.to_ascii_lowercase().as_str() {
            "bearer" => self.oauth.introspect(value.trim()).await,
            "basic" => {
                let (username, password) = decode_basic(value)?;
                self.oauth.password_grant(&username, &password).await
            }
            _ => return None,
        };

        match result {
            Ok(claims) => {
                debug!(provider = %self.config.name, scheme, sub = %claims.sub, "Authenticated via header");
                Some(claims)
            }
            Err(e) => {
                debug!(provider = %self.config.name, scheme, error = %e, "Header authentication failed");
                None
            }
        }
    }

    /// Store `claims` in the session; its lifetime follows the token expiry
    pub(crate) async fn save_claims(
        &self,
        headers: &HeaderMap,
        response: &mut HeaderMap,
        claims: &Claims,
    ) -> Result<(), AuthError> {
        let mut session = self.store.get(headers, &self.cookie_name).await?;
        session.set_claims(claims)?;
        if let Some(remaining) = claims.remaining_lifetime() {
            session.options.max_age = remaining;
        }
        self.store.save(headers, response, &mut session).await?;
        Ok(())
    }
}
