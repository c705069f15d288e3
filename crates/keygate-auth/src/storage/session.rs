//! Session records and their storage.
//!
//! A session is the only server-side state behind a token pair. It is keyed
//! by the token id (`jti`) shared by the access and refresh token, and
//! expires from the store together with the refresh token.
//!
//! Each session may also carry a short-lived record of its latest issued
//! token pair, which lets a refresh arriving within the minimum access-token
//! age return the same pair instead of minting a new one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::SharedStore;
use crate::AuthResult;
use crate::keys::Jwk;
use crate::token::claims::SecretClaims;
use crate::token::request::TokenResponse;

/// Persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session id, equal to the `jti` of its current tokens.
    pub id: String,

    /// When the session was first authenticated. Preserved across refreshes.
    #[serde(with = "time::serde::timestamp")]
    pub issued_on: OffsetDateTime,

    /// Seconds until the current refresh token expires, from last issuance.
    pub ttl: u64,

    /// Snapshot of the provider's secret claims.
    pub secret_claims: SecretClaims,

    /// Public half of the key that signed the current refresh token.
    pub refresh_key: Jwk,
}

/// The token pair most recently issued for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentIssue {
    /// The issued pair.
    pub response: TokenResponse,
    /// Access token expiry (Unix seconds), used to recompute `expires_in`.
    pub access_expires_at: i64,
}

impl RecentIssue {
    /// Returns the stored pair with `expires_in` counted from `now`.
    #[must_use]
    pub fn into_response(self, now: OffsetDateTime) -> TokenResponse {
        let remaining = (self.access_expires_at - now.unix_timestamp()).max(0);
        TokenResponse {
            expires_in: remaining as u64,
            ..self.response
        }
    }
}

/// Storage trait for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads a live session.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get(&self, id: &str) -> AuthResult<Option<Session>>;

    /// Writes a session that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn put(&self, session: &Session, ttl: Duration) -> AuthResult<()>;

    /// Loads the latest issued pair, if still within its window.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn recent_issue(&self, id: &str) -> AuthResult<Option<RecentIssue>>;

    /// Records the latest issued pair for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn put_recent_issue(&self, id: &str, issue: &RecentIssue, ttl: Duration)
    -> AuthResult<()>;

    /// Deletes a session and its recent-issue record.
    ///
    /// # Returns
    ///
    /// `true` if a live session was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete(&self, id: &str) -> AuthResult<bool>;

    /// Checks session liveness without loading it.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn exists(&self, id: &str) -> AuthResult<bool>;
}

/// Shared session store handle.
pub type SharedSessionStore = Arc<dyn SessionStore>;

/// [`SessionStore`] persisting JSON records in a [`KeyValueStore`](super::KeyValueStore).
pub struct KvSessionStore {
    store: SharedStore,
    namespace: String,
}

impl KvSessionStore {
    /// Creates a session store under `{namespace}:session:`.
    #[must_use]
    pub fn new(store: SharedStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}:session:{id}", self.namespace)
    }

    fn recent_key(&self, id: &str) -> String {
        format!("{}:recent:{id}", self.namespace)
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn get(&self, id: &str) -> AuthResult<Option<Session>> {
        match self.store.get(&self.key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, session: &Session, ttl: Duration) -> AuthResult<()> {
        let json = serde_json::to_string(session)?;
        self.store.put(&self.key(&session.id), &json, Some(ttl)).await
    }

    async fn recent_issue(&self, id: &str) -> AuthResult<Option<RecentIssue>> {
        match self.store.get(&self.recent_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_recent_issue(
        &self,
        id: &str,
        issue: &RecentIssue,
        ttl: Duration,
    ) -> AuthResult<()> {
        let json = serde_json::to_string(issue)?;
        self.store.put(&self.recent_key(id), &json, Some(ttl)).await
    }

    async fn delete(&self, id: &str) -> AuthResult<bool> {
        self.store.delete(&self.recent_key(id)).await?;
        self.store.delete(&self.key(id)).await
    }

    async fn exists(&self, id: &str) -> AuthResult<bool> {
        self.store.exists(&self.key(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::keys::SigningKeyPair;
    use crate::storage::{KeyValueStore, MemoryStore};

    fn sample_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            issued_on: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            ttl: 60,
            secret_claims: SecretClaims::default().with_claim("tenant", "acme"),
            refresh_key: SigningKeyPair::generate_ec().unwrap().to_jwk(),
        }
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let kv = Arc::new(MemoryStore::new());
        let sessions = KvSessionStore::new(kv.clone(), "ns");
        let session = sample_session("s1");

        sessions.put(&session, Duration::from_secs(60)).await.unwrap();
        assert!(kv.exists("ns:session:s1").await.unwrap());
        assert!(sessions.exists("s1").await.unwrap());
        assert_eq!(sessions.get("s1").await.unwrap(), Some(session));

        assert!(sessions.delete("s1").await.unwrap());
        assert!(!sessions.delete("s1").await.unwrap());
        assert!(sessions.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_expires_with_ttl() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::now_utc()));
        let sessions = KvSessionStore::new(Arc::new(MemoryStore::with_clock(clock.clone())), "ns");
        sessions
            .put(&sample_session("s1"), Duration::from_secs(30))
            .await
            .unwrap();

        clock.advance(time::Duration::seconds(31));
        assert!(!sessions.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_issue_window_and_delete() {
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let sessions = KvSessionStore::new(Arc::new(MemoryStore::with_clock(clock.clone())), "ns");
        let issue = RecentIssue {
            response: TokenResponse {
                access_token: "a".to_string(),
                token_type: "Bearer".to_string(),
                expires_in: 60,
                refresh_token: "r".to_string(),
            },
            access_expires_at: 1_700_000_060,
        };
        sessions.put(&sample_session("s1"), Duration::from_secs(600)).await.unwrap();
        sessions
            .put_recent_issue("s1", &issue, Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(time::Duration::seconds(5));
        let recent = sessions.recent_issue("s1").await.unwrap().unwrap();
        assert_eq!(recent.into_response(clock.now()).expires_in, 55);

        clock.advance(time::Duration::seconds(5));
        assert!(sessions.recent_issue("s1").await.unwrap().is_none());

        sessions
            .put_recent_issue("s1", &issue, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(sessions.delete("s1").await.unwrap());
        assert!(sessions.recent_issue("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_session_is_error() {
        let kv = Arc::new(MemoryStore::new());
        kv.put("ns:session:bad", "{", None).await.unwrap();
        let sessions = KvSessionStore::new(kv, "ns");
        assert!(sessions.get("bad").await.is_err());
    }
}
