// Outpost Routes
// Login start, OAuth callback, sign-out and ping

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;

use super::redirect::REDIRECT_PARAM;
use super::{Application, LEGACY_PREFIX, OUTPOST_PREFIX, redirect_response, with_headers};
use crate::auth::state::{consume_nonce, remember_nonce};
use crate::auth::{AuthError, OAuthState};
use crate::session::base::render_cookie;
use crate::session::{BaseStore, Session, SessionFilter};

/// Endpoints served by the outpost itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalRoute {
    Start,
    Callback,
    SignOut,
    Ping,
}

impl InternalRoute {
    pub fn from_path(path: &str) -> Option<Self> {
        let rest = path
            .strip_prefix(OUTPOST_PREFIX)
            .or_else(|| path.strip_prefix(LEGACY_PREFIX))?;
        match rest.trim_end_matches('/') {
            "/start" => Some(InternalRoute::Start),
            "/callback" => Some(InternalRoute::Callback),
            "/sign_out" => Some(InternalRoute::SignOut),
            "/ping" => Some(InternalRoute::Ping),
            _ => None,
        }
    }
}

fn query_params(url: &Url) -> HashMap<String, String> {
    serde_urlencoded::from_str(url.query().unwrap_or_default()).unwrap_or_default()
}

impl Application {
    pub(crate) async fn serve_internal(
        &self,
        route: InternalRoute,
        headers: &HeaderMap,
        url: &Url,
    ) -> Result<Response, AuthError> {
        match route {
            InternalRoute::Start => self.handle_start(headers, url).await,
            InternalRoute::Callback => self.handle_callback(headers, url).await,
            InternalRoute::SignOut => self.handle_sign_out(headers).await,
            InternalRoute::Ping => Ok(with_headers(StatusCode::NO_CONTENT, HeaderMap::new())),
        }
    }

    /// Issue a state bound to the session and redirect to the identity provider
    async fn handle_start(&self, headers: &HeaderMap, url: &Url) -> Result<Response, AuthError> {
        let mut response = HeaderMap::new();
        let mut session = self.store.get(headers, &self.cookie_name).await?;

        let redirect = query_params(url)
            .get(REDIRECT_PARAM)
            .and_then(|rd| self.check_redirect(rd))
            .or_else(|| session.redirect().and_then(|rd| self.check_redirect(rd)));

        if session.id().is_empty() {
            session.assign_id(BaseStore::generate_id());
        }
        let (token, state) = self.signer.mint(session.id(), redirect.as_deref())?;
        session.set_oauth_states(remember_nonce(session.oauth_states(), state.state));
        self.store.save(headers, &mut response, &mut session).await?;

        debug!(provider = %self.config.name, redirect = ?redirect, "Starting login");
        Ok(redirect_response(
            &self.oauth.authorization_url(&token)?,
            response,
        ))
    }

    /// Verify the state against the session and consume its nonce
    fn accept_state(&self, session: &mut Session, token: Option<&String>) -> Result<OAuthState, AuthError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::InvalidState)?;
        let state = self.signer.verify(token, session.id())?;
        let remaining =
            consume_nonce(&session.oauth_states(), &state.state).ok_or(AuthError::InvalidState)?;
        session.set_oauth_states(remaining);
        Ok(state)
    }

    async fn handle_callback(&self, headers: &HeaderMap, url: &Url) -> Result<Response, AuthError> {
        let params = query_params(url);
        let mut response = HeaderMap::new();
        let mut session = self.store.get(headers, &self.cookie_name).await?;

        let state = match self.accept_state(&mut session, params.get("state")) {
            Ok(state) => state,
            Err(e) => {
                warn!(provider = %self.config.name, error = %e, "Invalid callback state, restarting login");
                let destination = session
                    .redirect()
                    .and_then(|rd| self.check_redirect(rd))
                    .unwrap_or_else(|| self.external_url.to_string());
                return Ok(redirect_response(&self.start_url(&destination), response));
            }
        };

        if let Some(error) = params.get("error") {
            warn!(provider = %self.config.name, %error, "Identity provider returned an error");
            return Err(AuthError::InvalidCredentials);
        }
        let code = params
            .get("code")
            .filter(|code| !code.is_empty())
            .ok_or_else(|| AuthError::CodeExchangeFailed("callback without code".to_string()))?;

        let claims = self.oauth.redeem(code).await?;
        session.set_claims(&claims)?;
        if let Some(remaining) = claims.remaining_lifetime() {
            session.options.max_age = remaining;
        }

        let destination = state
            .redirect()
            .or_else(|| session.redirect())
            .and_then(|rd| self.check_redirect(rd))
            .unwrap_or_else(|| self.external_url.to_string());
        session.clear_redirect();
        self.store.save(headers, &mut response, &mut session).await?;

        info!(provider = %self.config.name, sub = %claims.sub, "User logged in");
        Ok(redirect_response(&destination, response))
    }

    /// Drop the session, revoke the user's other sessions and end the IdP session
    async fn handle_sign_out(&self, headers: &HeaderMap) -> Result<Response, AuthError> {
        let mut response = HeaderMap::new();
        let mut session = self.store.get(headers, &self.cookie_name).await?;
        let claims = session.claims();

        let destination = self
            .oauth
            .end_session_url(claims.as_ref().map(|c| c.raw_token.as_str()))
            .unwrap_or_else(|| self.external_url.to_string());

        let mut revoked = 0;
        if let Some(claims) = claims.as_ref().filter(|c| !c.sub.is_empty()) {
            match self.logout(&SessionFilter::Subject(claims.sub.clone())).await {
                Ok(removed) => revoked = removed,
                Err(e) => {
                    warn!(provider = %self.config.name, error = %e, "Failed to revoke sessions on sign-out");
                }
            }
        }

        session.clear_claims();
        session.options.max_age = -1;
        if revoked > 0 {
            // Already removed along with the user's other sessions
            let cookie = render_cookie(session.name(), "", &session.options);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.append(header::SET_COOKIE, value);
            }
        } else {
            self.store.save(headers, &mut response, &mut session).await?;
        }

        Ok(redirect_response(&destination, response))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::auth::ProxyMode;
    use crate::claims::Claims;

    fn location(response: &Response) -> Url {
        Url::parse(response.headers().get(header::LOCATION).unwrap().to_str().unwrap()).unwrap()
    }

    fn url(path: &str) -> Url {
        Url::parse("https://grafana.example.com").unwrap().join(path).unwrap()
    }

    #[test]
    fn test_route_parsing() {
        assert_eq!(
            InternalRoute::from_path("/outpost.goauthentik.io/start"),
            Some(InternalRoute::Start)
        );
        assert_eq!(
            InternalRoute::from_path("/akprox/callback"),
            Some(InternalRoute::Callback)
        );
        assert_eq!(
            InternalRoute::from_path("/outpost.goauthentik.io/sign_out/"),
            Some(InternalRoute::SignOut)
        );
        assert_eq!(
            InternalRoute::from_path("/outpost.goauthentik.io/ping"),
            Some(InternalRoute::Ping)
        );
        assert_eq!(InternalRoute::from_path("/outpost.goauthentik.io/other"), None);
        assert_eq!(InternalRoute::from_path("/start"), None);
    }

    #[tokio::test]
    async fn test_ping() {
        let app = application(provider(ProxyMode::Proxy));
        let response = app
            .serve_internal(InternalRoute::Ping, &HeaderMap::new(), &url("/outpost.goauthentik.io/ping"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_start_binds_state_to_session() {
        let app = application(provider(ProxyMode::Proxy));
        let response = app
            .handle_start(
                &HeaderMap::new(),
                &url("/outpost.goauthentik.io/start?rd=%2Fd%2Fabc"),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let target = location(&response);
        assert_eq!(target.host_str(), Some("idp.example.com"));
        let params = query_params(&target);
        let session = app
            .store()
            .get(&replay(response.headers()), app.cookie_name())
            .await
            .unwrap();

        let state = app.signer.verify(&params["state"], session.id()).unwrap();
        assert_eq!(state.redirect(), Some("https://grafana.example.com/d/abc"));
        assert_eq!(session.oauth_states(), vec![state.state]);
    }

    #[tokio::test]
    async fn test_start_drops_foreign_redirect() {
        let app = application(provider(ProxyMode::Proxy));
        let response = app
            .handle_start(
                &HeaderMap::new(),
                &url("/outpost.goauthentik.io/start?rd=https%3A%2F%2Fevil.example.net%2F"),
            )
            .await
            .unwrap();
        let params = query_params(&location(&response));
        let session = app
            .store()
            .get(&replay(response.headers()), app.cookie_name())
            .await
            .unwrap();
        let state = app.signer.verify(&params["state"], session.id()).unwrap();
        assert!(state.redirect().is_none());
    }

    #[tokio::test]
    async fn test_callback_with_foreign_state_restarts_login() {
        let app = application(provider(ProxyMode::Proxy));

        // State minted for another session
        let (token, _) = app.signer.mint("someone-else", None).unwrap();
        let callback = url(&format!(
            "/outpost.goauthentik.io/callback?code=abc&state={}",
            token
        ));
        let response = app.handle_callback(&HeaderMap::new(), &callback).await.unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let target = location(&response);
        assert_eq!(target.path(), "/outpost.goauthentik.io/start");
        assert_eq!(target.host_str(), Some("grafana.example.com"));
    }

    #[tokio::test]
    async fn test_callback_rejects_replayed_nonce() {
        let app = application(provider(ProxyMode::Proxy));
        let start = app
            .handle_start(&HeaderMap::new(), &url("/outpost.goauthentik.io/start"))
            .await
            .unwrap();
        let cookies = replay(start.headers());
        let mut session = app.store().get(&cookies, app.cookie_name()).await.unwrap();

        // Nonce already consumed
        let state_token = query_params(&location(&start))["state"].clone();
        session.set_oauth_states(Vec::new());
        let mut saved = HeaderMap::new();
        app.store()
            .save(&cookies, &mut saved, &mut session)
            .await
            .unwrap();

        let callback = url(&format!(
            "/outpost.goauthentik.io/callback?code=abc&state={}",
            state_token
        ));
        let response = app.handle_callback(&replay(&saved), &callback).await.unwrap();
        assert_eq!(location(&response).path(), "/outpost.goauthentik.io/start");
    }

    #[tokio::test]
    async fn test_sign_out_removes_server_side_session_once() {
        use crate::auth::OutpostSettings;
        use crate::session::{BaseStore, FilesystemStore, SessionStore};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let config = provider(ProxyMode::Proxy);
        let base = BaseStore::new(
            "filesystem",
            &config.provider_id,
            &config.cookie_secret,
            config.session_options(),
        )
        .unwrap();
        let metrics = base.metrics().clone();
        let store = Arc::new(
            FilesystemStore::new(base, dir.path(), std::time::Duration::from_secs(3600)).unwrap(),
        );
        let outpost = OutpostSettings {
            name: "test-outpost".to_string(),
            ..Default::default()
        };
        let app = Application::with_store(config, &outpost, store.clone()).unwrap();

        let mut cookies = HeaderMap::new();
        app.save_claims(
            &HeaderMap::new(),
            &mut cookies,
            &Claims {
                sub: "u1".into(),
                exp: chrono::Utc::now().timestamp() + 600,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(metrics.get("filesystem", "save").count, 1);

        let response = app.handle_sign_out(&replay(&cookies)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(set_cookie.contains("Max-Age=0"));

        // The subject revocation removed the row; no second delete through save
        assert_eq!(metrics.get("filesystem", "save").count, 1);
        assert!(store.get(&replay(&cookies), app.cookie_name()).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn test_sign_out_expires_session_with_hint() {
        let app = application(provider(ProxyMode::Proxy));
        let now = chrono::Utc::now().timestamp();
        let mut cookies = HeaderMap::new();
        app.save_claims(
            &HeaderMap::new(),
            &mut cookies,
            &Claims {
                sub: "u1".into(),
                exp: now + 600,
                raw_token: "id.token.jwt".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let response = app.handle_sign_out(&replay(&cookies)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let target = location(&response);
        assert_eq!(target.path(), "/application/o/grafana/end-session/");
        assert_eq!(query_params(&target)["id_token_hint"], "id.token.jwt");

        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(set_cookie.contains("Max-Age=0"));
    }
}
