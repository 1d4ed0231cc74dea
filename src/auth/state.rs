// OAuth State
// Signed state parameter bound to the session that started the login

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::error::AuthError;

/// Lifetime of an issued state in seconds
pub const STATE_LIFETIME_SECS: i64 = 15 * 60;

/// Outstanding nonces kept per session
pub const MAX_PENDING_STATES: usize = 10;

/// Claims of the state JWT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub iss: String,
    /// Session the login was started from
    pub sid: String,
    /// Random nonce, also recorded in the session
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub redirect: String,
    pub iat: i64,
    pub exp: i64,
}

impl OAuthState {
    pub fn redirect(&self) -> Option<&str> {
        (!self.redirect.is_empty()).then_some(self.redirect.as_str())
    }
}

/// Mints and verifies state tokens for one provider
pub struct StateSigner {
    issuer: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl StateSigner {
    pub fn new(client_id: &str, cookie_secret: &str) -> Self {
        Self {
            issuer: format!("goauthentik.io/outpost/{}", client_id),
            encoding: EncodingKey::from_secret(cookie_secret.as_bytes()),
            decoding: DecodingKey::from_secret(cookie_secret.as_bytes()),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Issue a state bound to `session_id`
    pub fn mint(&self, session_id: &str, redirect: Option<&str>) -> Result<(String, OAuthState), AuthError> {
        if session_id.is_empty() {
            return Err(AuthError::InvalidState);
        }
        let now = Utc::now();
        let nonce: [u8; 32] = rand::random();
        let state = OAuthState {
            iss: self.issuer.clone(),
            sid: session_id.to_string(),
            state: URL_SAFE_NO_PAD.encode(nonce),
            redirect: redirect.unwrap_or_default().to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + STATE_LIFETIME_SECS,
        };
        let token = encode(&Header::new(Algorithm::HS256), &state, &self.encoding)?;
        Ok((token, state))
    }

    /// Verify signature, issuer and expiry, then the session binding
    pub fn verify(&self, token: &str, session_id: &str) -> Result<OAuthState, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        let state = decode::<OAuthState>(token, &self.decoding, &validation)
            .map_err(|e| {
                debug!(error = %e, "Rejected OAuth state");
                AuthError::InvalidState
            })?
            .claims;

        if state.sid.is_empty() || state.sid != session_id {
            debug!("OAuth state is bound to another session");
            return Err(AuthError::InvalidState);
        }
        Ok(state)
    }
}

/// Record `nonce`, keeping at most [`MAX_PENDING_STATES`] entries
pub fn remember_nonce(mut pending: Vec<String>, nonce: String) -> Vec<String> {
    pending.push(nonce);
    if pending.len() > MAX_PENDING_STATES {
        let overflow = pending.len() - MAX_PENDING_STATES;
        pending.drain(..overflow);
    }
    pending
}

/// Remove `nonce`; `None` when it was never issued or already used
pub fn consume_nonce(pending: &[String], nonce: &str) -> Option<Vec<String>> {
    let position = pending
        .iter()
        .position(|candidate| bool::from(candidate.as_bytes().ct_eq(nonce.as_bytes())))?;
    let mut remaining = pending.to_vec();
    remaining.remove(position);
    Some(remaining)
}
