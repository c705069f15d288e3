//! In-memory key-value store.
//!
//! Suitable for tests, development and single-instance deployments. Expired
//! entries are hidden on read and physically removed either lazily or by
//! the optional sweep task.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::seq::IteratorRandom;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::KeyValueStore;
use crate::clock::{SharedClock, SystemClock};
use crate::{AuthError, AuthResult};

#[derive(Debug, Clone)]
enum StoredValue {
    Plain(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<OffsetDateTime>,
}

impl StoredEntry {
    fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// `DashMap`-backed [`KeyValueStore`].
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    clock: SharedClock,
}

impl MemoryStore {
    /// Creates an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store that evaluates TTLs against `clock`.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Returns true if no live keys remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }

    /// Starts a background task that purges expired entries periodically.
    pub fn start_sweeper(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("memory store sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let purged = self.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "purged expired entries");
                        }
                    }
                }
            }
        })
    }

    /// Reads a live entry, dropping it if it has expired.
    fn live(&self, key: &str) -> Option<StoredEntry> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?.clone();
        if entry.is_live(now) {
            Some(entry)
        } else {
            self.entries.remove_if(key, |_, e| !e.is_live(now));
            None
        }
    }

    fn expires_after(&self, ttl: Duration) -> AuthResult<OffsetDateTime> {
        let ttl = time::Duration::try_from(ttl)
            .map_err(|e| AuthError::storage(format!("invalid ttl: {e}")))?;
        Ok(self.clock.now() + ttl)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> AuthError {
    AuthError::storage(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(StoredEntry {
                value: StoredValue::Plain(value),
                ..
            }) => Ok(Some(value)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> AuthResult<()> {
        let expires_at = ttl.map(|ttl| self.expires_after(ttl)).transpose()?;
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: StoredValue::Plain(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AuthResult<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn exists(&self, key: &str) -> AuthResult<bool> {
        Ok(self.live(key).is_some())
    }

    async fn set_expiration(&self, key: &str, at: OffsetDateTime) -> AuthResult<bool> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_expiration(&self, key: &str, at: OffsetDateTime) -> AuthResult<bool> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => match entry.expires_at {
                Some(current) if current < at => {
                    entry.expires_at = Some(at);
                    Ok(true)
                }
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    async fn add_to_set(&self, key: &str, members: &[String]) -> AuthResult<usize> {
        let now = self.clock.now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    let set: BTreeSet<String> = members.iter().cloned().collect();
                    let added = set.len();
                    occupied.insert(StoredEntry {
                        value: StoredValue::Set(set),
                        expires_at: None,
                    });
                    return Ok(added);
                }
                match &mut occupied.get_mut().value {
                    StoredValue::Set(set) => Ok(members
                        .iter()
                        .filter(|m| set.insert((*m).clone()))
                        .count()),
                    StoredValue::Plain(_) => Err(wrong_type(key)),
                }
            }
            Entry::Vacant(vacant) => {
                let set: BTreeSet<String> = members.iter().cloned().collect();
                let added = set.len();
                vacant.insert(StoredEntry {
                    value: StoredValue::Set(set),
                    expires_at: None,
                });
                Ok(added)
            }
        }
    }

    async fn random_member(&self, key: &str) -> AuthResult<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(StoredEntry {
                value: StoredValue::Set(set),
                ..
            }) => Ok(set.iter().choose(&mut rand::thread_rng()).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn members(&self, key: &str) -> AuthResult<Vec<String>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(StoredEntry {
                value: StoredValue::Set(set),
                ..
            }) => Ok(set.into_iter().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("a", "1", None).await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.exists("a").await.unwrap());
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (store, clock) = store_with_clock();
        store
            .put("a", "1", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        clock.advance(time::Duration::seconds(9));
        assert!(store.exists("a").await.unwrap());

        clock.advance(time::Duration::seconds(1));
        assert!(!store.exists("a").await.unwrap());
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_extend_expiration_only_moves_forward() {
        let (store, clock) = store_with_clock();
        let now = clock.now();
        store.add_to_set("s", &["k".to_string()]).await.unwrap();
        assert!(store.set_expiration("s", now + time::Duration::seconds(100)).await.unwrap());

        assert!(!store
            .extend_expiration("s", now + time::Duration::seconds(50))
            .await
            .unwrap());
        assert!(store
            .extend_expiration("s", now + time::Duration::seconds(200))
            .await
            .unwrap());

        clock.advance(time::Duration::seconds(150));
        assert!(store.exists("s").await.unwrap());
        clock.advance(time::Duration::seconds(50));
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_expiration_missing_key() {
        let store = MemoryStore::new();
        assert!(!store
            .set_expiration("missing", OffsetDateTime::now_utc())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_add_to_set_is_idempotent() {
        let store = MemoryStore::new();
        let members = vec!["a".to_string(), "b".to_string()];

        assert_eq!(store.add_to_set("s", &members).await.unwrap(), 2);
        assert_eq!(store.add_to_set("s", &members).await.unwrap(), 0);
        assert_eq!(
            store.add_to_set("s", &["c".to_string()]).await.unwrap(),
            1
        );

        let mut all = store.members("s").await.unwrap();
        all.sort();
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_random_member_draws_from_set() {
        let store = MemoryStore::new();
        let members = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        store.add_to_set("s", &members).await.unwrap();

        for _ in 0..20 {
            let drawn = store.random_member("s").await.unwrap().unwrap();
            assert!(members.contains(&drawn));
        }
        assert!(store.random_member("empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let store = MemoryStore::new();
        store.put("plain", "v", None).await.unwrap();
        store.add_to_set("set", &["m".to_string()]).await.unwrap();

        assert!(store.add_to_set("plain", &["m".to_string()]).await.is_err());
        assert!(store.members("plain").await.is_err());
        assert!(store.get("set").await.is_err());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store
            .put("short", "1", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.put("long", "2", None).await.unwrap();

        clock.advance(time::Duration::seconds(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
