use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::base::BaseStore;
use super::{Session, SessionOptions, StoreError};

/// Durable projection of a [`Session`], one row per `(provider_id, session_key)`
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySession {
    pub id: Uuid,
    pub provider_id: String,
    pub session_key: String,
    pub session_data: Vec<u8>,
    /// Claims as JSON text, `{}` when absent
    pub claims: String,
    pub redirect: String,
    pub expires: Option<DateTime<Utc>>,
    pub expiring: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ProxySession {
    /// Build the row for an id-bearing session about to be upserted
    pub fn from_session(base: &BaseStore, session: &Session) -> Result<Self, StoreError> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            provider_id: base.provider_id().to_string(),
            session_key: session.id().to_string(),
            session_data: base.serializer().serialize(&session.values)?,
            claims: session.claims_json(),
            redirect: session.redirect().unwrap_or_default().to_string(),
            expires: Some(base.expiry(session.options.max_age)),
            expiring: session.options.max_age > 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.deleted_at.is_none() && self.expires.is_none_or(|expires| expires > now)
    }

    /// Rebuild the session; the remaining lifetime becomes its max-age
    pub fn into_session(
        self,
        base: &BaseStore,
        name: &str,
        options: &SessionOptions,
    ) -> Result<Session, StoreError> {
        let values = base.serializer().deserialize(&self.session_data)?;
        let mut options = options.clone();
        if let Some(expires) = self.expires {
            let remaining = (expires - Utc::now()).num_seconds();
            if remaining > 0 {
                options.max_age = remaining;
            }
        }
        Ok(Session::restored(self.session_key, name, values, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Claims;
    use chrono::Duration;

    fn base() -> BaseStore {
        BaseStore::new("test", "provider-1", "secret", SessionOptions::default()).unwrap()
    }

    #[test]
    fn projects_claims_and_redirect() {
        let base = base();
        let mut session = base.fresh_session("cookie");
        session.assign_id("abc".into());
        session
            .set_claims(&Claims {
                sub: "u1".into(),
                ..Default::default()
            })
            .unwrap();
        session.set_redirect("https://app.example.com/x");
        session.options.max_age = 3600;

        let record = ProxySession::from_session(&base, &session).unwrap();
        assert_eq!(record.provider_id, "provider-1");
        assert_eq!(record.session_key, "abc");
        assert!(record.claims.contains("\"sub\":\"u1\""));
        assert_eq!(record.redirect, "https://app.example.com/x");
        assert!(record.expiring);
        assert!(record.is_live(Utc::now()));
        assert!(!record.is_live(Utc::now() + Duration::seconds(3601)));

        let restored = record
            .into_session(&base, "cookie", base.options())
            .unwrap();
        assert!(!restored.is_new());
        assert_eq!(restored.id(), "abc");
        assert_eq!(restored.claims().unwrap().sub, "u1");
        assert!(restored.options.max_age <= 3600);
    }

    #[test]
    fn tombstoned_rows_are_not_live() {
        let base = base();
        let mut session = base.fresh_session("cookie");
        session.assign_id("abc".into());
        let mut record = ProxySession::from_session(&base, &session).unwrap();
        record.deleted_at = Some(Utc::now());
        assert!(!record.is_live(Utc::now()));
    }
}
