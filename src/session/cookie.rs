//! Client-side session store.
//!
//! The whole value map travels inside an encrypted, authenticated cookie.
//! Nothing is kept server-side, so deletion is just an expired cookie and
//! there is nothing to enumerate or clean up.

use async_trait::async_trait;
use axum::http::HeaderMap;
use tracing::debug;

use super::base::{BaseStore, read_cookie};
use super::{CleanupOutcome, Session, SessionFilter, SessionStore, StoreError};

/// Reserved value key carrying the session id inside the cookie
const ID_KEY: &str = "_sid";

pub struct CookieStore {
    base: BaseStore,
}

impl CookieStore {
    pub fn new(base: BaseStore) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &BaseStore {
        &self.base
    }
}

#[async_trait]
impl SessionStore for CookieStore {
    fn backend(&self) -> &'static str {
        "cookie"
    }

    async fn new_session(&self, headers: &HeaderMap, name: &str) -> Result<Session, StoreError> {
        self.base
            .observe("load", async {
                let Some(value) = read_cookie(headers, name) else {
                    return Ok(self.base.fresh_session(name));
                };
                let decoded = self
                    .base
                    .codec()
                    .decode(name, value, self.base.options().max_age)
                    .and_then(|payload| self.base.serializer().deserialize(&payload).ok());
                match decoded {
                    Some(mut values) => {
                        let id = values
                            .remove(ID_KEY)
                            .and_then(|value| value.as_str().map(str::to_string))
                            .filter(|id| !id.is_empty())
                            .unwrap_or_else(BaseStore::generate_id);
                        Ok(Session::restored(
                            id,
                            name,
                            values,
                            self.base.options().clone(),
                        ))
                    }
                    None => {
                        debug!(cookie = name, "Discarding undecodable session cookie");
                        Ok(self.base.fresh_session(name))
                    }
                }
            })
            .await
    }

    async fn save(
        &self,
        _headers: &HeaderMap,
        response: &mut HeaderMap,
        session: &mut Session,
    ) -> Result<(), StoreError> {
        self.base
            .observe("save", async {
                if session.options.max_age <= 0 {
                    return self.base.expire_cookie(response, session);
                }
                if session.id().is_empty() {
                    session.assign_id(BaseStore::generate_id());
                }
                let mut values = session.values.clone();
                values.insert(
                    ID_KEY.to_string(),
                    serde_json::Value::String(session.id().to_string()),
                );
                let payload = self.base.serializer().serialize(&values)?;
                let encoded = self.base.codec().encode(session.name(), &payload)?;
                self.base
                    .write_cookie(response, session.name(), &encoded, &session.options)
            })
            .await
    }

    async fn delete(&self, _session: &Session) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(Vec::new())
    }

    async fn cleanup(&self) -> Result<CleanupOutcome, StoreError> {
        Ok(CleanupOutcome::default())
    }

    async fn logout_sessions(&self, filter: &SessionFilter) -> Result<u64, StoreError> {
        debug!(?filter, "Cookie sessions cannot be revoked server-side");
        Ok(0)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
