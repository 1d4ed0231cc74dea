// Redirect Handling
// Post-login destinations, allowlisted paths and the redirect to the login start

use axum::http::HeaderMap;
use axum::response::Response;
use tracing::{debug, warn};
use url::Url;

use super::{Application, OUTPOST_PREFIX, redirect_response};
use crate::auth::{AuthError, ProxyMode};

/// Query parameter carrying the post-login destination
pub const REDIRECT_PARAM: &str = "rd";

impl Application {
    /// Validated absolute destination for `rd`, or `None` when it is not allowed
    ///
    /// Relative values resolve against the external host. In forward_domain
    /// mode any host below the cookie domain is accepted, otherwise only the
    /// external host's origin.
    pub fn check_redirect(&self, rd: &str) -> Option<String> {
        if rd.is_empty() {
            return None;
        }
        let url = match Url::parse(rd) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self.external_url.join(rd).ok()?,
            Err(_) => return None,
        };

        let allowed = match self.config.mode {
            ProxyMode::ForwardDomain => url
                .host_str()
                .is_some_and(|host| host_within(host, self.cookie_domain())),
            _ => url.origin() == self.external_url.origin(),
        };
        if !allowed {
            debug!(provider = %self.config.name, redirect = %rd, "Dropping redirect outside the allowed hosts");
            return None;
        }
        Some(url.to_string())
    }

    /// Whether `url` may be accessed without authentication
    pub fn is_allowlisted(&self, url: &Url) -> bool {
        if self.skip_patterns.is_empty() {
            return false;
        }
        let subject = match self.config.mode {
            ProxyMode::Proxy | ProxyMode::ForwardSingle => url.path().to_string(),
            ProxyMode::ForwardDomain => url.to_string(),
        };
        self.skip_patterns
            .iter()
            .any(|pattern| pattern.is_match(&subject))
    }

    /// Login start URL carrying `destination`
    pub fn start_url(&self, destination: &str) -> String {
        let mut url = self.external_url.clone();
        url.set_path(&format!("{}/start", OUTPOST_PREFIX));
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair(REDIRECT_PARAM, destination);
        url.to_string()
    }

    /// Remember `target` in the session and send the browser to the login start
    pub async fn redirect_to_start(
        &self,
        headers: &HeaderMap,
        mut response: HeaderMap,
        target: &Url,
    ) -> Result<Response, AuthError> {
        let destination = self.check_redirect(target.as_str()).unwrap_or_else(|| {
            warn!(provider = %self.config.name, url = %target, "Invalid redirect found");
            self.external_url.to_string()
        });

        let mut session = self.store.get(headers, &self.cookie_name).await?;
        if session.redirect().is_none() {
            session.set_redirect(destination.clone());
            self.store.save(headers, &mut response, &mut session).await?;
        }

        Ok(redirect_response(&self.start_url(&destination), response))
    }
}

/// `host` equals `domain` or is a sub-domain of it
fn host_within(host: &str, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
