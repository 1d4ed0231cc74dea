// OIDC Endpoint Resolution
// Splits provider endpoints into browser-facing and backchannel addresses

use url::Url;

use super::config::{OidcConfig, OutpostSettings};
use super::error::AuthError;

/// Endpoints used by one application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OidcEndpoints {
    pub authorize: String,
    pub end_session: String,
    pub issuer: String,
    pub token: String,
    pub userinfo: String,
    pub jwks: String,
    pub introspection: String,
    /// Host header sent on backchannel requests
    pub host_header: Option<String>,
}

impl OidcEndpoints {
    /// Browser-facing endpoints move to the browser host, backchannel
    /// endpoints to the internal host
    pub fn resolve(oidc: &OidcConfig, outpost: &OutpostSettings) -> Result<Self, AuthError> {
        let mut endpoints = Self {
            authorize: oidc.authorization_endpoint.clone(),
            end_session: oidc.end_session_endpoint.clone(),
            issuer: oidc.issuer.clone(),
            token: oidc.token_endpoint.clone(),
            userinfo: oidc.userinfo_endpoint.clone(),
            jwks: oidc.jwks_uri.clone(),
            introspection: oidc.introspection_endpoint.clone(),
            host_header: None,
        };

        let Some(browser) = outpost
            .authentik_host_browser
            .as_deref()
            .filter(|host| !host.is_empty())
        else {
            return Ok(endpoints);
        };
        let browser = parse_origin("authentik_host_browser", browser)?;

        endpoints.authorize = rebase(&endpoints.authorize, &browser);
        endpoints.end_session = rebase(&endpoints.end_session, &browser);
        endpoints.issuer = rebase(&endpoints.issuer, &browser);

        if !outpost.authentik_host.is_empty() {
            let internal = parse_origin("authentik_host", &outpost.authentik_host)?;
            endpoints.token = rebase(&endpoints.token, &internal);
            endpoints.userinfo = rebase(&endpoints.userinfo, &internal);
            endpoints.jwks = rebase(&endpoints.jwks, &internal);
            endpoints.introspection = rebase(&endpoints.introspection, &internal);
            if internal.host_str() != browser.host_str() || internal.port() != browser.port() {
                endpoints.host_header = Some(authority(&browser));
            }
        }

        Ok(endpoints)
    }
}

fn parse_origin(key: &str, value: &str) -> Result<Url, AuthError> {
    let url = Url::parse(value).map_err(|e| AuthError::InvalidConfig {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(AuthError::InvalidConfig {
            key: key.to_string(),
            reason: "must contain a host".to_string(),
        });
    }
    Ok(url)
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Replace scheme, host and port of `raw`; unparsable values are kept as-is
fn rebase(raw: &str, origin: &Url) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    if url.set_scheme(origin.scheme()).is_err()
        || url.set_host(origin.host_str()).is_err()
        || url.set_port(origin.port()).is_err()
    {
        return raw.to_string();
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oidc() -> OidcConfig {
        OidcConfig {
            issuer: "https://idp.internal:9443/application/o/grafana/".to_string(),
            authorization_endpoint: "https://idp.internal:9443/application/o/authorize/"
                .to_string(),
            token_endpoint: "https://idp.internal:9443/application/o/token/".to_string(),
            userinfo_endpoint: "https://idp.internal:9443/application/o/userinfo/".to_string(),
            end_session_endpoint:
                "https://idp.internal:9443/application/o/grafana/end-session/".to_string(),
            jwks_uri: "https://idp.internal:9443/application/o/grafana/jwks/".to_string(),
            introspection_endpoint:
                "https://idp.internal:9443/application/o/introspect/".to_string(),
        }
    }

    #[test]
    fn test_without_browser_host_endpoints_are_unchanged() {
        let endpoints = OidcEndpoints::resolve(&oidc(), &OutpostSettings::default()).unwrap();
        assert_eq!(endpoints.authorize, oidc().authorization_endpoint);
        assert_eq!(endpoints.token, oidc().token_endpoint);
        assert!(endpoints.host_header.is_none());
    }

    #[test]
    fn test_browser_host_rewrites_front_channel_only() {
        let outpost = OutpostSettings {
            authentik_host: "http://idp-svc:9000".to_string(),
            authentik_host_browser: Some("https://login.example.com".to_string()),
            ..Default::default()
        };
        let endpoints = OidcEndpoints::resolve(&oidc(), &outpost).unwrap();

        assert_eq!(
            endpoints.authorize,
            "https://login.example.com/application/o/authorize/"
        );
        assert_eq!(
            endpoints.end_session,
            "https://login.example.com/application/o/grafana/end-session/"
        );
        assert_eq!(
            endpoints.issuer,
            "https://login.example.com/application/o/grafana/"
        );
        assert_eq!(endpoints.token, "http://idp-svc:9000/application/o/token/");
        assert_eq!(
            endpoints.jwks,
            "http://idp-svc:9000/application/o/grafana/jwks/"
        );
        assert_eq!(
            endpoints.introspection,
            "http://idp-svc:9000/application/o/introspect/"
        );
        assert_eq!(endpoints.host_header.as_deref(), Some("login.example.com"));
    }

    #[test]
    fn test_invalid_browser_host_is_a_config_error() {
        let outpost = OutpostSettings {
            authentik_host_browser: Some("not a url".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            OidcEndpoints::resolve(&oidc(), &outpost),
            Err(AuthError::InvalidConfig { .. })
        ));
    }
}
