//! Time-windowed signing-key pools.
//!
//! Every block of `block_size` seconds owns a set of independently generated
//! key pairs stored at `{namespace}:signing-keys:{blockStart}`. New tokens are
//! signed with a random key from the current block; verifiers trust the
//! previous and the current block.
//!
//! # Caching
//!
//! - Parsed signing keys are cached by kid, so the private PEM of a drawn key
//!   is only parsed once per process.
//! - The verification set is a versioned entry tagged with the block it was
//!   built for. It is rebuilt lazily on read once the current block moves
//!   past that tag or the entry outlives `verification_cache_ttl`.
//! - Keys another instance adds to a cached block are picked up by
//!   [`KeyRotationManager::reload_verification_keys`], which validators call
//!   when a token names a kid the cached set lacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use jsonwebtoken::DecodingKey;
use time::OffsetDateTime;

use super::block::{block_key, block_start};
use super::signing_key::{Jwk, Jwks, SigningAlgorithm, SigningKeyPair, StoredSigningKey};
use crate::clock::SharedClock;
use crate::config::{MAX_BLOCK_SIZE, TokenConfig};
use crate::runtime::CryptoPool;
use crate::storage::SharedStore;
use crate::{AuthError, AuthResult};

/// Block expiration as a multiple of the block size, counted from block start.
pub(crate) const BLOCK_RETENTION_FACTOR: i64 = 3;

/// Upper bound on how long a parsed signing key stays cached.
const MAX_PARSED_KEY_TTL: Duration = Duration::from_secs(24 * 3600);

/// Minimum spacing between reloads forced by unknown kids.
const MISS_RELOAD_INTERVAL: time::Duration = time::Duration::seconds(1);

/// Rotation settings derived from [`TokenConfig`].
#[derive(Debug, Clone)]
pub struct RotationSettings {
    /// Key namespace.
    pub namespace: String,
    /// Algorithm for generated keys.
    pub algorithm: SigningAlgorithm,
    /// Block width in seconds.
    pub block_size: i64,
    /// Keys generated per block.
    pub keys_per_block: usize,
    /// Populator tick.
    pub populate_interval: Duration,
    /// Maximum age of a cached verification set.
    pub verification_cache_ttl: Duration,
}

impl RotationSettings {
    /// Extracts rotation settings from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` for an unsupported algorithm or a
    /// block size of zero or above [`MAX_BLOCK_SIZE`].
    pub fn from_config(config: &TokenConfig) -> AuthResult<Self> {
        let algorithm = config
            .signing_algorithm()
            .map_err(|e| AuthError::configuration(e.to_string()))?;
        let block_size = Some(config.rotation.block_size)
            .filter(|size| *size <= MAX_BLOCK_SIZE)
            .and_then(|size| i64::try_from(size.as_secs()).ok())
            .filter(|secs| *secs > 0)
            .ok_or_else(|| AuthError::configuration("rotation.block_size out of range"))?;

        Ok(Self {
            namespace: config.namespace.clone(),
            algorithm,
            block_size,
            keys_per_block: config.rotation.keys_per_block,
            populate_interval: config.rotation.populate_interval,
            verification_cache_ttl: config.rotation.verification_cache_ttl,
        })
    }
}

/// One verification key.
#[derive(Clone)]
pub struct VerificationKey {
    /// Algorithm the key verifies.
    pub algorithm: SigningAlgorithm,
    /// Public key.
    pub decoding_key: DecodingKey,
    /// Published form.
    pub jwk: Jwk,
}

impl VerificationKey {
    /// Builds a verification key from a public JWK.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWK is malformed.
    pub fn from_jwk(jwk: Jwk) -> AuthResult<Self> {
        Ok(Self {
            algorithm: jwk.algorithm()?,
            decoding_key: jwk.to_decoding_key()?,
            jwk,
        })
    }
}

/// Public keys of the previous and current block, indexed by kid.
#[derive(Clone, Default)]
pub struct VerificationKeySet {
    keys: HashMap<String, VerificationKey>,
}

impl VerificationKeySet {
    /// Wraps an explicit kid-to-key map.
    #[must_use]
    pub fn from_keys(keys: HashMap<String, VerificationKey>) -> Self {
        Self { keys }
    }

    /// Looks up a key by kid.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the set holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Exports the set as a JWKS document, sorted by kid.
    #[must_use]
    pub fn to_jwks(&self) -> Jwks {
        let mut keys: Vec<Jwk> = self.keys.values().map(|k| k.jwk.clone()).collect();
        keys.sort_by(|a, b| a.kid.cmp(&b.kid));
        Jwks { keys }
    }
}

/// Versioned cache entry for the verification set.
struct VerificationCacheEntry {
    /// Start of the block this set was built for.
    block_start: i64,
    built_at: OffsetDateTime,
    keys: Arc<VerificationKeySet>,
}

/// Supplies signing keys and verification sets from the rotation pool.
pub struct KeyRotationManager {
    store: SharedStore,
    clock: SharedClock,
    pool: CryptoPool,
    settings: RotationSettings,
    verification: ArcSwapOption<VerificationCacheEntry>,
    /// Time of the last reload forced by a kid miss; held across the reload.
    miss_reload: tokio::sync::Mutex<Option<OffsetDateTime>>,
    signing_keys: moka::sync::Cache<String, Arc<SigningKeyPair>>,
}

impl KeyRotationManager {
    /// Creates a manager over `store`.
    #[must_use]
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        pool: CryptoPool,
        settings: RotationSettings,
    ) -> Self {
        let retention = Duration::from_secs(
            settings
                .block_size
                .checked_mul(BLOCK_RETENTION_FACTOR)
                .and_then(|secs| u64::try_from(secs).ok())
                .unwrap_or(u64::MAX),
        )
        .min(MAX_PARSED_KEY_TTL);
        let signing_keys = moka::sync::Cache::builder()
            .max_capacity((settings.keys_per_block * 4) as u64)
            .time_to_live(retention)
            .build();

        Self {
            store,
            clock,
            pool,
            settings,
            verification: ArcSwapOption::empty(),
            miss_reload: tokio::sync::Mutex::new(None),
            signing_keys,
        }
    }

    /// Rotation settings.
    #[must_use]
    pub fn settings(&self) -> &RotationSettings {
        &self.settings
    }

    /// The crypto pool shared with the token pipeline.
    #[must_use]
    pub fn crypto_pool(&self) -> &CryptoPool {
        &self.pool
    }

    fn block_at(&self, now: OffsetDateTime, offset: i64) -> i64 {
        block_start(now.unix_timestamp(), self.settings.block_size, offset)
    }

    /// Draws a random signing key from the current block.
    ///
    /// The block's store expiration is pushed to at least
    /// `now + access_lifetime`, so a token signed now stays verifiable for
    /// its whole life. If the populator has not created the current block
    /// yet, it is created on demand.
    ///
    /// # Errors
    ///
    /// Returns a system error if the store is unavailable or a stored key
    /// cannot be loaded.
    pub async fn signing_key(&self, access_lifetime: Duration) -> AuthResult<Arc<SigningKeyPair>> {
        let now = self.clock.now();
        let start = self.block_at(now, 0);
        let key = block_key(&self.settings.namespace, start);

        let member = match self.store.random_member(&key).await? {
            Some(member) => member,
            None => {
                tracing::info!(block = start, "current signing-key block missing, populating");
                self.populate_block(start).await?;
                self.store
                    .random_member(&key)
                    .await?
                    .ok_or_else(|| AuthError::storage(format!("signing-key block {key} is empty")))?
            }
        };

        let lifetime = time::Duration::try_from(access_lifetime)
            .map_err(|e| AuthError::configuration(format!("access lifetime: {e}")))?;
        self.store.extend_expiration(&key, now + lifetime).await?;

        self.load_signing_key(member).await
    }

    async fn load_signing_key(&self, member: String) -> AuthResult<Arc<SigningKeyPair>> {
        let stored: StoredSigningKey = serde_json::from_str(&member)
            .map_err(|e| AuthError::crypto(format!("malformed signing-key record: {e}")))?;

        if let Some(cached) = self.signing_keys.get(&stored.kid) {
            return Ok(cached);
        }

        let kid = stored.kid.clone();
        let pair = self
            .pool
            .run(move || Ok(Arc::new(SigningKeyPair::from_stored(&stored)?)))
            .await?;
        self.signing_keys.insert(kid, pair.clone());
        Ok(pair)
    }

    /// Returns the public keys of the previous and current block.
    ///
    /// # Errors
    ///
    /// Returns a system error if the store is unavailable.
    pub async fn verification_keys(&self) -> AuthResult<Arc<VerificationKeySet>> {
        let now = self.clock.now();
        let current = self.block_at(now, 0);

        if let Some(entry) = self.verification.load_full() {
            let age = now - entry.built_at;
            if entry.block_start == current && age < self.settings.verification_cache_ttl {
                return Ok(entry.keys.clone());
            }
        }

        self.rebuild_verification_set(now).await
    }

    /// Rebuilds the verification set from the store, bypassing the cache.
    ///
    /// Called when a token names a kid the cached set lacks, which happens
    /// when another instance sharing the store populated the current block.
    /// Reloads are single-flight and spaced at least one second apart;
    /// callers arriving inside that window get the cached set.
    ///
    /// # Errors
    ///
    /// Returns a system error if the store is unavailable.
    pub async fn reload_verification_keys(&self) -> AuthResult<Arc<VerificationKeySet>> {
        let mut last = self.miss_reload.lock().await;
        let now = self.clock.now();
        if last.is_some_and(|at| now - at < MISS_RELOAD_INTERVAL) {
            drop(last);
            return self.verification_keys().await;
        }

        let keys = self.rebuild_verification_set(now).await?;
        *last = Some(now);
        Ok(keys)
    }

    async fn rebuild_verification_set(
        &self,
        now: OffsetDateTime,
    ) -> AuthResult<Arc<VerificationKeySet>> {
        let current = self.block_at(now, 0);
        let keys = Arc::new(self.build_verification_set(current).await?);
        self.verification.store(Some(Arc::new(VerificationCacheEntry {
            block_start: current,
            built_at: now,
            keys: keys.clone(),
        })));
        tracing::debug!(block = current, keys = keys.len(), "rebuilt verification key set");
        Ok(keys)
    }

    async fn build_verification_set(&self, current: i64) -> AuthResult<VerificationKeySet> {
        let mut set = VerificationKeySet::default();
        for start in [current.saturating_sub(self.settings.block_size), current] {
            let key = block_key(&self.settings.namespace, start);
            for member in self.store.members(&key).await? {
                match parse_public(&member) {
                    Ok(verification) => {
                        set.keys.insert(verification.jwk.kid.clone(), verification);
                    }
                    Err(e) => {
                        tracing::warn!(block = start, error = %e, "skipping malformed signing-key record");
                    }
                }
            }
        }
        Ok(set)
    }

    /// Drops the cached verification set so the next read rebuilds it.
    pub fn invalidate_verification_cache(&self) {
        self.verification.store(None);
    }

    /// Exports the verification set as a JWKS document.
    ///
    /// # Errors
    ///
    /// Returns a system error if the store is unavailable.
    pub async fn jwks(&self) -> AuthResult<Jwks> {
        Ok(self.verification_keys().await?.to_jwks())
    }

    /// Ensures the current and next blocks exist.
    ///
    /// # Returns
    ///
    /// The number of blocks this call created.
    ///
    /// # Errors
    ///
    /// Returns a system error if generation or the store fails.
    pub async fn populate_once(&self) -> AuthResult<usize> {
        let now = self.clock.now();
        let mut created = 0;
        for offset in [0, 1] {
            let start = self.block_at(now, offset);
            let key = block_key(&self.settings.namespace, start);
            if self.store.exists(&key).await? {
                continue;
            }
            self.populate_block(start).await?;
            created += 1;
        }
        Ok(created)
    }

    /// Generates and inserts the keys of one block.
    ///
    /// Insertion is "add to set", so two instances racing on the same block
    /// only grow it. The block expires `3 * block_size` after it starts.
    async fn populate_block(&self, start: i64) -> AuthResult<()> {
        let key = block_key(&self.settings.namespace, start);
        let algorithm = self.settings.algorithm;
        let count = self.settings.keys_per_block;

        let members = self
            .pool
            .run(move || {
                (0..count)
                    .map(|_| -> AuthResult<String> {
                        let pair = SigningKeyPair::generate(algorithm)?;
                        Ok(serde_json::to_string(&pair.to_stored())?)
                    })
                    .collect::<AuthResult<Vec<String>>>()
            })
            .await?;

        let added = self.store.add_to_set(&key, &members).await?;
        let expires_at = BLOCK_RETENTION_FACTOR
            .checked_mul(self.settings.block_size)
            .and_then(|retention| start.checked_add(retention))
            .ok_or_else(|| AuthError::internal("block expiration overflows"))
            .and_then(|secs| {
                OffsetDateTime::from_unix_timestamp(secs)
                    .map_err(|e| AuthError::internal(format!("block expiration: {e}")))
            })?;
        self.store.set_expiration(&key, expires_at).await?;

        tracing::info!(
            block = start,
            added,
            algorithm = %algorithm,
            "generated signing-key block"
        );

        if start <= self.block_at(self.clock.now(), 0) {
            self.invalidate_verification_cache();
        }
        Ok(())
    }
}

fn parse_public(member: &str) -> AuthResult<VerificationKey> {
    #[derive(serde::Deserialize)]
    struct PublicOnly {
        public: Jwk,
    }
    let record: PublicOnly = serde_json::from_str(member)?;
    VerificationKey::from_jwk(record.public)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::storage::{KeyValueStore, MemoryStore};

    const BLOCK: i64 = 100;

    fn settings() -> RotationSettings {
        RotationSettings {
            namespace: "test".to_string(),
            algorithm: SigningAlgorithm::ES384,
            block_size: BLOCK,
            keys_per_block: 2,
            populate_interval: Duration::from_secs(1),
            verification_cache_ttl: Duration::from_secs(3600),
        }
    }

    fn create_test_manager() -> (Arc<KeyRotationManager>, Arc<MemoryStore>, Arc<ManualClock>) {
        // Start mid-block, well away from a boundary.
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_050).unwrap(),
        ));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let manager = Arc::new(KeyRotationManager::new(
            store.clone(),
            clock.clone(),
            CryptoPool::new(2),
            settings(),
        ));
        (manager, store, clock)
    }

    fn current_key(clock: &ManualClock, offset: i64) -> String {
        block_key("test", block_start(clock.now().unix_timestamp(), BLOCK, offset))
    }

    #[tokio::test]
    async fn test_populate_creates_current_and_next_block() {
        let (manager, store, clock) = create_test_manager();

        assert_eq!(manager.populate_once().await.unwrap(), 2);
        assert_eq!(store.members(&current_key(&clock, 0)).await.unwrap().len(), 2);
        assert_eq!(store.members(&current_key(&clock, 1)).await.unwrap().len(), 2);

        // Idempotent per tick.
        assert_eq!(manager.populate_once().await.unwrap(), 0);
        assert_eq!(store.members(&current_key(&clock, 0)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_block_expires_after_retention() {
        let (manager, store, clock) = create_test_manager();
        manager.populate_once().await.unwrap();
        let key = current_key(&clock, 0);
        let start = block_start(clock.now().unix_timestamp(), BLOCK, 0);

        clock.set(OffsetDateTime::from_unix_timestamp(start + 3 * BLOCK - 1).unwrap());
        assert!(store.exists(&key).await.unwrap());
        clock.set(OffsetDateTime::from_unix_timestamp(start + 3 * BLOCK).unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_signing_key_populates_on_demand() {
        let (manager, store, clock) = create_test_manager();

        let key = manager.signing_key(Duration::from_secs(10)).await.unwrap();
        let members = store.members(&current_key(&clock, 0)).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.contains(&key.kid)));
    }

    #[tokio::test]
    async fn test_signing_key_extends_block_expiration() {
        let (manager, store, clock) = create_test_manager();
        manager.populate_once().await.unwrap();
        let key = current_key(&clock, 0);
        let start = block_start(clock.now().unix_timestamp(), BLOCK, 0);

        // Far longer than the retention window.
        manager.signing_key(Duration::from_secs(1000)).await.unwrap();

        clock.set(OffsetDateTime::from_unix_timestamp(start + 3 * BLOCK + 10).unwrap());
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_signing_key_is_cached_by_kid() {
        let (manager, _store, _clock) = create_test_manager();
        manager.populate_once().await.unwrap();

        let mut seen: HashMap<String, Arc<SigningKeyPair>> = HashMap::new();
        for _ in 0..10 {
            let key = manager.signing_key(Duration::from_secs(10)).await.unwrap();
            if let Some(previous) = seen.get(&key.kid) {
                assert!(Arc::ptr_eq(previous, &key));
            }
            seen.insert(key.kid.clone(), key);
        }
    }

    #[tokio::test]
    async fn test_verification_set_spans_previous_and_current() {
        let (manager, _store, clock) = create_test_manager();
        manager.populate_once().await.unwrap();
        let old = manager.signing_key(Duration::from_secs(10)).await.unwrap();

        clock.advance(time::Duration::seconds(BLOCK));
        manager.populate_once().await.unwrap();
        let keys = manager.verification_keys().await.unwrap();
        assert_eq!(keys.len(), 4);
        assert!(keys.get(&old.kid).is_some());

        clock.advance(time::Duration::seconds(BLOCK));
        manager.populate_once().await.unwrap();
        let keys = manager.verification_keys().await.unwrap();
        assert!(keys.get(&old.kid).is_none());
    }

    #[tokio::test]
    async fn test_verification_cache_is_versioned_by_block() {
        let (manager, store, clock) = create_test_manager();
        manager.populate_once().await.unwrap();
        let first = manager.verification_keys().await.unwrap();

        // Same block: served from cache even if the store grows.
        store
            .add_to_set(&current_key(&clock, 0), &["not json".to_string()])
            .await
            .unwrap();
        let again = manager.verification_keys().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // New block: rebuilt, malformed record skipped.
        clock.advance(time::Duration::seconds(BLOCK));
        let rebuilt = manager.verification_keys().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(rebuilt.len(), 4);
    }

    async fn add_foreign_key(store: &MemoryStore, clock: &ManualClock) -> String {
        let foreign = SigningKeyPair::generate(SigningAlgorithm::ES384).unwrap();
        let record = serde_json::to_string(&foreign.to_stored()).unwrap();
        store
            .add_to_set(&current_key(clock, 0), &[record])
            .await
            .unwrap();
        foreign.kid.clone()
    }

    #[tokio::test]
    async fn test_reload_picks_up_keys_added_by_another_instance() {
        let (manager, store, clock) = create_test_manager();
        manager.populate_once().await.unwrap();
        let cached = manager.verification_keys().await.unwrap();

        let kid = add_foreign_key(&store, &clock).await;
        assert!(manager.verification_keys().await.unwrap().get(&kid).is_none());

        let reloaded = manager.reload_verification_keys().await.unwrap();
        assert!(reloaded.get(&kid).is_some());
        assert_eq!(reloaded.len(), cached.len() + 1);

        // The reloaded set replaces the cached one.
        assert!(manager.verification_keys().await.unwrap().get(&kid).is_some());
    }

    #[tokio::test]
    async fn test_reload_is_rate_limited() {
        let (manager, store, clock) = create_test_manager();
        manager.populate_once().await.unwrap();
        manager.reload_verification_keys().await.unwrap();

        let kid = add_foreign_key(&store, &clock).await;
        let throttled = manager.reload_verification_keys().await.unwrap();
        assert!(throttled.get(&kid).is_none());

        clock.advance(time::Duration::seconds(1));
        let reloaded = manager.reload_verification_keys().await.unwrap();
        assert!(reloaded.get(&kid).is_some());
    }

    #[test]
    fn test_settings_reject_oversized_block() {
        let mut config = TokenConfig::default();
        config.rotation.block_size = Duration::from_secs(u64::MAX);
        assert!(matches!(
            RotationSettings::from_config(&config),
            Err(AuthError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_jwks_export_has_no_private_material() {
        let (manager, _store, _clock) = create_test_manager();
        manager.populate_once().await.unwrap();

        let jwks = manager.jwks().await.unwrap();
        assert_eq!(jwks.keys.len(), 2);
        let json = serde_json::to_string(&jwks).unwrap();
        assert!(!json.contains("PRIVATE"));
        assert!(jwks.keys.iter().all(|k| k.alg == "ES384" && k.use_ == "sig"));
    }
}
