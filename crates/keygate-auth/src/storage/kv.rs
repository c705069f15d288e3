//! Key-value store trait shared by sessions and signing-key blocks.
//!
//! The engine needs a small set of primitives: plain string values with an
//! optional TTL, unordered string sets, and absolute expirations. Both
//! session records and signing-key blocks live in the same backing store,
//! distinguished by key prefix.
//!
//! # Implementations
//!
//! - [`MemoryStore`](super::MemoryStore) - single-process, for tests and
//!   development
//! - `keygate-auth-redis` - Redis backend shared across gateway instances

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;

/// Async key-value store with set and expiration support.
///
/// Implementations must be safe to share across tasks. A key holds either a
/// string value or a set; using a set operation on a string key (or the
/// reverse) is a storage error.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a string value.
    ///
    /// # Returns
    ///
    /// `None` if the key does not exist or has expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get(&self, key: &str) -> AuthResult<Option<String>>;

    /// Writes a string value, replacing any previous value.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to write
    /// * `value` - The value to store
    /// * `ttl` - Optional time-to-live; `None` stores without expiration
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> AuthResult<()>;

    /// Deletes a key of any kind.
    ///
    /// # Returns
    ///
    /// `true` if a live key was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete(&self, key: &str) -> AuthResult<bool>;

    /// Checks whether a live key exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn exists(&self, key: &str) -> AuthResult<bool>;

    /// Sets an absolute expiration on an existing key.
    ///
    /// # Returns
    ///
    /// `false` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn set_expiration(&self, key: &str, at: OffsetDateTime) -> AuthResult<bool>;

    /// Pushes a key's expiration out to `at` unless it already expires later.
    ///
    /// Keys without an expiration are left untouched.
    ///
    /// # Returns
    ///
    /// `true` if the expiration was changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn extend_expiration(&self, key: &str, at: OffsetDateTime) -> AuthResult<bool>;

    /// Adds members to a set, creating it if absent. Existing members are
    /// ignored, so concurrent population of the same set converges.
    ///
    /// # Returns
    ///
    /// The number of members that were newly added.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails or the key holds a
    /// plain value.
    async fn add_to_set(&self, key: &str, members: &[String]) -> AuthResult<usize>;

    /// Returns one uniformly random member of a set.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn random_member(&self, key: &str) -> AuthResult<Option<String>>;

    /// Returns every member of a set, or an empty list if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn members(&self, key: &str) -> AuthResult<Vec<String>>;
}

/// Shared store handle, chosen once at startup.
pub type SharedStore = Arc<dyn KeyValueStore>;
