// Header Projection
// Writes the caller's identity into the headers seen by the upstream

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use tracing::{debug, trace};

use super::Application;
use crate::claims::Claims;

/// User attribute holding extra headers for the upstream
pub const ADDITIONAL_HEADERS_ATTRIBUTE: &str = "additionalHeaders";

pub const USER_AGENT: &str = concat!("goauthentik.io/outpost/", env!("CARGO_PKG_VERSION"));

/// Identity headers outside the `x-authentik-` namespace
const LEGACY_HEADERS: &[&str] = &[
    "x-auth-username",
    "x-auth-groups",
    "x-forwarded-email",
    "x-forwarded-preferred-username",
    "x-forwarded-user",
];

const NAMESPACE_PREFIX: &str = "x-authentik-";

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_bytes(value.as_bytes()) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => debug!(header = %name, "Skipping header with invalid value"),
    }
}

fn set_static(headers: &mut HeaderMap, name: &'static str, value: &str) {
    set(headers, HeaderName::from_static(name), value);
}

/// JSON attribute value as header text
fn attribute_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl Application {
    /// Drop every identity header a client could have supplied itself
    pub fn strip_identity_headers(&self, headers: &mut HeaderMap) {
        let namespaced: Vec<HeaderName> = headers
            .keys()
            .filter(|name| name.as_str().starts_with(NAMESPACE_PREFIX))
            .cloned()
            .collect();
        for name in namespaced {
            headers.remove(&name);
        }
        for name in LEGACY_HEADERS {
            headers.remove(*name);
        }
        if self.config.basic_auth_enabled || self.config.intercept_header_auth {
            headers.remove(header::AUTHORIZATION);
        }
    }

    /// Project `claims` into `headers`
    pub fn add_headers(&self, headers: &mut HeaderMap, claims: &Claims) {
        let groups = claims.groups.join("|");
        let entitlements = claims.entitlements.join("|");

        // Legacy names
        set_static(headers, "x-auth-username", &claims.preferred_username);
        set_static(headers, "x-auth-groups", &groups);
        set_static(headers, "x-forwarded-email", &claims.email);
        set_static(headers, "x-forwarded-preferred-username", &claims.preferred_username);
        set_static(headers, "x-forwarded-user", &claims.sub);

        set_static(headers, "x-authentik-username", &claims.preferred_username);
        set_static(headers, "x-authentik-groups", &groups);
        set_static(headers, "x-authentik-entitlements", &entitlements);
        set_static(headers, "x-authentik-email", &claims.email);
        set_static(headers, "x-authentik-name", &claims.name);
        set_static(headers, "x-authentik-uid", &claims.sub);
        set_static(headers, "x-authentik-jwt", &claims.raw_token);

        set_static(headers, "x-authentik-meta-jwks", &self.oauth.endpoints().jwks);
        set_static(headers, "x-authentik-meta-outpost", &self.outpost.name);
        set_static(headers, "x-authentik-meta-provider", &self.config.name);
        set_static(headers, "x-authentik-meta-app", &self.config.application_slug);
        set_static(headers, "x-authentik-meta-version", USER_AGENT);

        self.set_authorization_header(headers, claims);

        let additional = claims
            .proxy
            .user_attributes
            .get(ADDITIONAL_HEADERS_ATTRIBUTE)
            .and_then(|value| value.as_object());
        if let Some(additional) = additional {
            trace!(count = additional.len(), "Setting additional headers");
            for (key, value) in additional {
                match HeaderName::from_bytes(key.as_bytes()) {
                    Ok(name) => set(headers, name, &attribute_text(value)),
                    Err(_) => debug!(header = %key, "Skipping invalid additional header name"),
                }
            }
        }
    }

    /// Synthesized Basic credentials from user attributes
    fn set_authorization_header(&self, headers: &mut HeaderMap, claims: &Claims) {
        if !self.config.basic_auth_enabled {
            return;
        }
        let password = claims
            .user_attribute(&self.config.basic_auth_password_attribute)
            .unwrap_or_default();
        let username = claims
            .user_attribute(&self.config.basic_auth_user_attribute)
            .unwrap_or(&claims.email);
        if username.is_empty() && password.is_empty() {
            return;
        }
        let encoded = STANDARD.encode(format!("{}:{}", username, password));
        set(headers, header::AUTHORIZATION, &format!("Basic {}", encoded));
    }
}
