// Shared Session Store Policy
// Expiry computation, session id generation, serializer selection, cookie
// encoding and operation metrics used by every backend

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use axum::http::{HeaderMap, HeaderValue, header};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::metrics::StoreMetrics;
use super::serializer::{BinarySerializer, SessionSerializer};
use super::{Session, SessionOptions, StoreError};

const NONCE_LEN: usize = 12;
const TIMESTAMP_LEN: usize = 8;

/// Authenticated encryption for cookie payloads.
///
/// Layout: base64url(nonce || AES-256-GCM(issued_at_be || payload)), with the
/// cookie name bound as associated data so a value cannot be replayed under
/// another cookie name.
#[derive(Clone)]
pub struct CookieCodec {
    cipher: Aes256Gcm,
}

impl CookieCodec {
    pub fn new(secret: &str) -> Result<Self, StoreError> {
        if secret.is_empty() {
            return Err(StoreError::Configuration(
                "cookie secret must not be empty".to_string(),
            ));
        }
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| StoreError::Configuration(format!("invalid cookie key: {}", e)))?;
        Ok(Self { cipher })
    }

    pub fn encode(&self, name: &str, payload: &[u8]) -> Result<String, StoreError> {
        let mut plaintext = Vec::with_capacity(TIMESTAMP_LEN + payload.len());
        plaintext.extend_from_slice(&Utc::now().timestamp().to_be_bytes());
        plaintext.extend_from_slice(payload);

        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from(nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|e| StoreError::Serialization(format!("cookie encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Decrypt a cookie value. `max_age > 0` also rejects values issued more
    /// than `max_age` seconds ago.
    pub fn decode(&self, name: &str, value: &str, max_age: i64) -> Option<Vec<u8>> {
        let raw = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        if raw.len() < NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce_array: [u8; NONCE_LEN] = nonce_bytes.try_into().ok()?;
        let plaintext = self
            .cipher
            .decrypt(
                &Nonce::from(nonce_array),
                Payload {
                    msg: ciphertext,
                    aad: name.as_bytes(),
                },
            )
            .ok()?;
        if plaintext.len() < TIMESTAMP_LEN {
            return None;
        }
        let (timestamp, payload) = plaintext.split_at(TIMESTAMP_LEN);
        let issued_at = i64::from_be_bytes(timestamp.try_into().ok()?);
        if max_age > 0 && issued_at + max_age < Utc::now().timestamp() {
            debug!(cookie = name, "Cookie value is older than its max age");
            return None;
        }
        Some(payload.to_vec())
    }
}

/// Expiry for a session saved at `now` with `max_age` seconds
pub fn expiry_for(max_age: i64, now: DateTime<Utc>) -> DateTime<Utc> {
    if max_age <= 0 {
        now
    } else {
        now + Duration::seconds(max_age)
    }
}

/// Value of the named cookie from the request headers
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            let (key, value) = cookie.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

/// Render a `Set-Cookie` header value
pub fn render_cookie(name: &str, value: &str, options: &SessionOptions) -> String {
    let mut cookie = format!("{}={}; Path={}", name, value, options.path);
    if let Some(domain) = options.domain.as_deref().filter(|d| !d.is_empty()) {
        cookie.push_str(&format!("; Domain={}", domain));
    }
    if options.max_age > 0 {
        let expires = Utc::now() + Duration::seconds(options.max_age);
        cookie.push_str(&format!(
            "; Max-Age={}; Expires={}",
            options.max_age,
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
    } else if options.max_age < 0 {
        cookie.push_str("; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:01 GMT");
    }
    if options.http_only {
        cookie.push_str("; HttpOnly");
    }
    if options.secure {
        cookie.push_str("; Secure");
    }
    cookie.push_str(&format!("; SameSite={}", options.same_site.as_str()));
    cookie
}

/// Policy shared by all backends
#[derive(Clone)]
pub struct BaseStore {
    backend: &'static str,
    provider_id: String,
    options: SessionOptions,
    serializer: Arc<dyn SessionSerializer>,
    codec: CookieCodec,
    metrics: Arc<StoreMetrics>,
}

impl BaseStore {
    pub fn new(
        backend: &'static str,
        provider_id: impl Into<String>,
        cookie_secret: &str,
        options: SessionOptions,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            backend,
            provider_id: provider_id.into(),
            options,
            serializer: Arc::new(BinarySerializer),
            codec: CookieCodec::new(cookie_secret)?,
            metrics: Arc::new(StoreMetrics::new()),
        })
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn SessionSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn serializer(&self) -> &dyn SessionSerializer {
        self.serializer.as_ref()
    }

    pub fn codec(&self) -> &CookieCodec {
        &self.codec
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    pub fn expiry(&self, max_age: i64) -> DateTime<Utc> {
        expiry_for(max_age, Utc::now())
    }

    /// 256 random bits, base64url encoded
    pub fn generate_id() -> String {
        let random_bytes: [u8; 32] = rand::random();
        URL_SAFE_NO_PAD.encode(random_bytes)
    }

    pub fn fresh_session(&self, name: &str) -> Session {
        Session::new(name, self.options.clone())
    }

    /// Session id carried in the request's cookie, if it authenticates
    pub fn session_id_from_request(&self, headers: &HeaderMap, name: &str) -> Option<String> {
        let value = read_cookie(headers, name)?;
        let payload = self.codec.decode(name, value, self.options.max_age)?;
        String::from_utf8(payload).ok().filter(|id| !id.is_empty())
    }

    /// Emit the cookie carrying the session id
    pub fn write_session_cookie(
        &self,
        response: &mut HeaderMap,
        session: &Session,
    ) -> Result<(), StoreError> {
        let encoded = self.codec.encode(session.name(), session.id().as_bytes())?;
        self.write_cookie(response, session.name(), &encoded, &session.options)
    }

    pub fn write_cookie(
        &self,
        response: &mut HeaderMap,
        name: &str,
        value: &str,
        options: &SessionOptions,
    ) -> Result<(), StoreError> {
        let cookie = render_cookie(name, value, options);
        let header_value = HeaderValue::from_str(&cookie)
            .map_err(|e| StoreError::Serialization(format!("invalid cookie header: {}", e)))?;
        response.append(header::SET_COOKIE, header_value);
        Ok(())
    }

    /// Emit a cookie that the browser drops immediately
    pub fn expire_cookie(&self, response: &mut HeaderMap, session: &Session) -> Result<(), StoreError> {
        let mut options = session.options.clone();
        options.max_age = -1;
        self.write_cookie(response, session.name(), "", &options)
    }

    /// Time `fut` and record it against `operation`
    pub async fn observe<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.metrics
            .record(self.backend, operation, started.elapsed(), result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_now_for_non_positive_max_age() {
        let now = Utc::now();
        assert_eq!(expiry_for(0, now), now);
        assert_eq!(expiry_for(-1, now), now);
        assert_eq!(expiry_for(3600, now), now + Duration::seconds(3600));
    }

    #[test]
    fn generated_ids_are_long_and_unique() {
        let a = BaseStore::generate_id();
        let b = BaseStore::generate_id();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }

    #[test]
    fn codec_binds_cookie_name() {
        let codec = CookieCodec::new("cookie-secret").unwrap();
        let encoded = codec.encode("session_a", b"payload").unwrap();
        assert_eq!(
            codec.decode("session_a", &encoded, 3600).as_deref(),
            Some(&b"payload"[..])
        );
        assert!(codec.decode("session_b", &encoded, 3600).is_none());

        let other = CookieCodec::new("other-secret").unwrap();
        assert!(other.decode("session_a", &encoded, 3600).is_none());
        assert!(codec.decode("session_a", "garbage", 3600).is_none());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            CookieCodec::new(""),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn reads_cookie_among_many() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; authentik_proxy_abc=value123; other=1"),
        );
        assert_eq!(read_cookie(&headers, "authentik_proxy_abc"), Some("value123"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn renders_cookie_attributes() {
        let options = SessionOptions {
            domain: Some("example.com".into()),
            secure: true,
            ..Default::default()
        };
        let cookie = render_cookie("name", "value", &options);
        assert!(cookie.starts_with("name=value; Path=/; Domain=example.com; Max-Age=2592000"));
        assert!(cookie.contains("; HttpOnly"));
        assert!(cookie.contains("; Secure"));
        assert!(cookie.ends_with("SameSite=Lax"));

        let expired = render_cookie(
            "name",
            "",
            &SessionOptions {
                max_age: -1,
                ..Default::default()
            },
        );
        assert!(expired.contains("Max-Age=0"));
    }

    #[test]
    fn session_id_round_trips_through_cookie() {
        let base = BaseStore::new("test", "1", "secret", SessionOptions::default()).unwrap();
        let mut session = base.fresh_session("authentik_proxy_abc");
        session.assign_id(BaseStore::generate_id());

        let mut response = HeaderMap::new();
        base.write_session_cookie(&mut response, &session).unwrap();
        let set_cookie = response
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let pair = set_cookie.split(';').next().unwrap().to_string();

        let mut request = HeaderMap::new();
        request.insert(header::COOKIE, HeaderValue::from_str(&pair).unwrap());
        assert_eq!(
            base.session_id_from_request(&request, "authentik_proxy_abc")
                .as_deref(),
            Some(session.id())
        );
    }
}
