//! Access token validation for incoming requests.

use std::sync::Arc;

use super::TokenRejection;
use super::access::{AccessTokenRules, decode_access_token};
use super::claims::IdentityClaims;
use crate::clock::SharedClock;
use crate::keys::KeyRotationManager;
use crate::runtime::PenaltyScheduler;
use crate::storage::SharedSessionStore;
use crate::{AuthError, AuthResult};

/// Validates bearer access tokens.
///
/// A token is accepted only if it decompresses within the configured cap,
/// is signed by a key of the previous or current block, carries valid
/// claims and its session still exists. Every refusal looks the same to the
/// caller: `AuthError::InvalidToken` after the penalty delay.
pub struct ClaimsValidator {
    keys: Arc<KeyRotationManager>,
    sessions: SharedSessionStore,
    penalty: Arc<PenaltyScheduler>,
    clock: SharedClock,
    issuer: String,
    leeway: i64,
    max_decompressed_size: usize,
}

impl ClaimsValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(
        keys: Arc<KeyRotationManager>,
        sessions: SharedSessionStore,
        penalty: Arc<PenaltyScheduler>,
        clock: SharedClock,
        issuer: impl Into<String>,
        leeway: i64,
        max_decompressed_size: usize,
    ) -> Self {
        Self {
            keys,
            sessions,
            penalty,
            clock,
            issuer: issuer.into(),
            leeway,
            max_decompressed_size,
        }
    }

    /// Validates `token` and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` for any refused token and a system
    /// error if the key pool or session store is unavailable.
    pub async fn validate(&self, token: &str) -> AuthResult<IdentityClaims> {
        match self.check(token).await? {
            Ok(claims) => Ok(claims),
            Err(rejection) => {
                tracing::debug!(
                    reason = rejection.reason(),
                    detail = %rejection,
                    "access token rejected"
                );
                self.penalty.apply().await;
                Err(AuthError::InvalidToken)
            }
        }
    }

    async fn check(&self, token: &str) -> AuthResult<Result<IdentityClaims, TokenRejection>> {
        let keys = self.keys.verification_keys().await?;
        let rules = AccessTokenRules {
            issuer: &self.issuer,
            leeway: self.leeway,
            max_decompressed_size: self.max_decompressed_size,
        };

        let now = self.clock.now();
        let claims = match decode_access_token(token, &keys, &rules, now) {
            Ok(claims) => claims,
            // The key may have been added by another instance since the set
            // was cached.
            Err(TokenRejection::UnknownKey(kid)) => {
                let reloaded = self.keys.reload_verification_keys().await?;
                if reloaded.get(&kid).is_none() {
                    return Ok(Err(TokenRejection::UnknownKey(kid)));
                }
                match decode_access_token(token, &reloaded, &rules, now) {
                    Ok(claims) => claims,
                    Err(rejection) => return Ok(Err(rejection)),
                }
            }
            Err(rejection) => return Ok(Err(rejection)),
        };

        // decode_access_token guarantees a non-empty jti.
        let jti = claims.jti.as_deref().unwrap_or_default();
        if !self.sessions.exists(jti).await? {
            return Ok(Err(TokenRejection::NoSession));
        }

        Ok(Ok(claims))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use time::OffsetDateTime;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::keys::{RotationSettings, SigningAlgorithm, SigningKeyPair};
    use crate::runtime::CryptoPool;
    use crate::storage::{KvSessionStore, MemoryStore, RecentIssue, Session, SessionStore};
    use crate::token::access::{CompressionPolicy, encode_access_token};
    use crate::token::claims::SecretClaims;

    const ISSUER: &str = "https://gw.test";

    /// Session store that is always down.
    struct UnavailableSessions;

    #[async_trait]
    impl SessionStore for UnavailableSessions {
        async fn get(&self, _id: &str) -> AuthResult<Option<Session>> {
            Err(AuthError::storage("connection refused"))
        }

        async fn put(&self, _session: &Session, _ttl: Duration) -> AuthResult<()> {
            Err(AuthError::storage("connection refused"))
        }

        async fn recent_issue(&self, _id: &str) -> AuthResult<Option<RecentIssue>> {
            Err(AuthError::storage("connection refused"))
        }

        async fn put_recent_issue(
            &self,
            _id: &str,
            _issue: &RecentIssue,
            _ttl: Duration,
        ) -> AuthResult<()> {
            Err(AuthError::storage("connection refused"))
        }

        async fn delete(&self, _id: &str) -> AuthResult<bool> {
            Err(AuthError::storage("connection refused"))
        }

        async fn exists(&self, _id: &str) -> AuthResult<bool> {
            Err(AuthError::storage("connection refused"))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        keys: Arc<KeyRotationManager>,
        sessions: SharedSessionStore,
        validator: ClaimsValidator,
    }

    fn create_test_validator() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        ));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let keys = Arc::new(KeyRotationManager::new(
            store.clone(),
            clock.clone(),
            CryptoPool::new(2),
            RotationSettings {
                namespace: "t".to_string(),
                algorithm: SigningAlgorithm::ES384,
                block_size: 3600,
                keys_per_block: 1,
                populate_interval: Duration::from_secs(60),
                verification_cache_ttl: Duration::from_secs(60),
            },
        ));
        let sessions: SharedSessionStore = Arc::new(KvSessionStore::new(store, "t"));
        let validator = ClaimsValidator::new(
            keys.clone(),
            sessions.clone(),
            Arc::new(PenaltyScheduler::new(Duration::ZERO).unwrap()),
            clock.clone(),
            ISSUER,
            0,
            20 * 1024,
        );
        Fixture {
            clock,
            keys,
            sessions,
            validator,
        }
    }

    async fn issue(fixture: &Fixture, jti: &str, lifetime: i64) -> String {
        let key = fixture.keys.signing_key(Duration::from_secs(60)).await.unwrap();
        let now = fixture.clock.now().unix_timestamp();
        let mut claims = IdentityClaims::new("user-1");
        claims.iss = Some(ISSUER.to_string());
        claims.jti = Some(jti.to_string());
        claims.iat = Some(now);
        claims.exp = Some(now + lifetime);

        fixture
            .sessions
            .put(
                &Session {
                    id: jti.to_string(),
                    issued_on: fixture.clock.now(),
                    ttl: 600,
                    secret_claims: SecretClaims::default(),
                    refresh_key: key.to_jwk(),
                },
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        let policy = CompressionPolicy {
            enabled: true,
            max_jwt_size: 4096,
            max_decompressed_size: 20 * 1024,
        };
        encode_access_token(&key, &claims, &policy).unwrap()
    }

    #[tokio::test]
    async fn test_validate_live_token() {
        let fixture = create_test_validator();
        let token = issue(&fixture, "s1", 60).await;

        let claims = fixture.validator.validate(&token).await.unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.jti.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_validate_requires_live_session() {
        let fixture = create_test_validator();
        let token = issue(&fixture, "s1", 60).await;
        fixture.sessions.delete("s1").await.unwrap();

        let err = fixture.validator.validate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_validate_rejects_expired() {
        let fixture = create_test_validator();
        let token = issue(&fixture, "s1", 60).await;

        fixture.clock.advance(time::Duration::seconds(61));
        let err = fixture.validator.validate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_validate_rejects_foreign_key() {
        let fixture = create_test_validator();
        issue(&fixture, "s1", 60).await;

        let stranger = SigningKeyPair::generate_ec().unwrap();
        let mut claims = IdentityClaims::new("user-1");
        claims.iss = Some(ISSUER.to_string());
        claims.jti = Some("s1".to_string());
        claims.exp = Some(fixture.clock.now().unix_timestamp() + 60);
        let policy = CompressionPolicy {
            enabled: false,
            max_jwt_size: 4096,
            max_decompressed_size: 4096,
        };
        let forged = encode_access_token(&stranger, &claims, &policy).unwrap();

        let err = fixture.validator.validate(&forged).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_validate_rejects_garbage() {
        let fixture = create_test_validator();
        for token in ["", "not-a-jwt", "a.b.c", "~Zgarbage"] {
            let err = fixture.validator.validate(token).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidToken), "accepted {token:?}");
        }
    }

    #[tokio::test]
    async fn test_session_store_outage_is_system_error() {
        let fixture = create_test_validator();
        let token = issue(&fixture, "s1", 60).await;
        let validator = ClaimsValidator::new(
            fixture.keys.clone(),
            Arc::new(UnavailableSessions),
            Arc::new(PenaltyScheduler::new(Duration::ZERO).unwrap()),
            fixture.clock.clone(),
            ISSUER,
            0,
            20 * 1024,
        );

        let err = validator.validate(&token).await.unwrap_err();
        assert!(err.is_system_error());
        assert!(!matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_rejection_waits_for_penalty() {
        let fixture = create_test_validator();
        let delay = Duration::from_millis(80);
        let validator = ClaimsValidator::new(
            fixture.keys.clone(),
            fixture.sessions.clone(),
            Arc::new(PenaltyScheduler::new(delay).unwrap()),
            fixture.clock.clone(),
            ISSUER,
            0,
            20 * 1024,
        );

        let token = issue(&fixture, "s1", 60).await;
        fixture.sessions.delete("s1").await.unwrap();

        let started = Instant::now();
        assert!(matches!(validator.validate(&token).await, Err(AuthError::InvalidToken)));
        assert!(started.elapsed() >= delay);
    }
}
