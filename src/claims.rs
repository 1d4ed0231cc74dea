//! Identity claims carried by a session.
//!
//! Claims are extracted from a verified ID token or an introspection
//! response and stored in the session under the `claims` key. They are
//! never mutated in place; a new login replaces them wholesale.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Identity assertion about the current principal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: String,

    /// Expiry as unix seconds
    #[serde(default)]
    pub exp: i64,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub email_verified: bool,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub preferred_username: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub entitlements: Vec<String>,

    #[serde(default)]
    pub sid: String,

    /// Proxy extension, always present after deserialization
    #[serde(rename = "ak_proxy", default, deserialize_with = "null_as_default")]
    pub proxy: ProxyClaims,

    /// Original token the claims were decoded from
    #[serde(default)]
    pub raw_token: String,
}

/// Provider-specific extension of the claims
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyClaims {
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_attributes: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_override: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_header: Option<String>,

    #[serde(default)]
    pub is_superuser: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Claims {
    /// True when `exp` is set and lies in the past
    pub fn is_expired(&self) -> bool {
        self.exp > 0 && self.exp <= chrono::Utc::now().timestamp()
    }

    /// Seconds until `exp`, if it is in the future
    pub fn remaining_lifetime(&self) -> Option<i64> {
        let remaining = self.exp - chrono::Utc::now().timestamp();
        (self.exp > 0 && remaining > 0).then_some(remaining)
    }

    /// String-valued user attribute, if present
    pub fn user_attribute(&self, key: &str) -> Option<&str> {
        self.proxy
            .user_attributes
            .get(key)
            .and_then(|value| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_proxy_extension_defaults_to_empty() {
        let claims: Claims = serde_json::from_value(json!({
            "sub": "u1",
            "exp": 10,
            "email": "user@example.com"
        }))
        .unwrap();

        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.proxy, ProxyClaims::default());
        assert!(claims.groups.is_empty());
    }

    #[test]
    fn null_proxy_extension_defaults_to_empty() {
        let claims: Claims = serde_json::from_value(json!({
            "sub": "u1",
            "ak_proxy": null,
            "groups": null
        }))
        .unwrap();

        assert!(claims.proxy.user_attributes.is_empty());
        assert!(claims.groups.is_empty());
    }

    #[test]
    fn proxy_extension_is_decoded() {
        let claims: Claims = serde_json::from_value(json!({
            "sub": "u1",
            "ak_proxy": {
                "user_attributes": {"department": "ops", "level": 3},
                "backend_override": "http://tenant-a.internal:8080",
                "host_header": "tenant-a.example.com",
                "is_superuser": true
            }
        }))
        .unwrap();

        assert_eq!(claims.user_attribute("department"), Some("ops"));
        assert_eq!(claims.user_attribute("level"), None);
        assert_eq!(
            claims.proxy.backend_override.as_deref(),
            Some("http://tenant-a.internal:8080")
        );
        assert!(claims.proxy.is_superuser);
    }

    #[test]
    fn expiry_helpers() {
        let now = chrono::Utc::now().timestamp();
        let live = Claims {
            exp: now + 600,
            ..Default::default()
        };
        assert!(!live.is_expired());
        assert!(live.remaining_lifetime().unwrap() > 590);

        let stale = Claims {
            exp: now - 1,
            ..Default::default()
        };
        assert!(stale.is_expired());
        assert_eq!(stale.remaining_lifetime(), None);

        assert!(!Claims::default().is_expired());
    }
}
