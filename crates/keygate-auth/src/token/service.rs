//! Token service facade.
//!
//! Wires the key rotation manager, session store, issuance pipeline,
//! validator and revoker together from a single [`TokenConfig`]:
//!
//! - Initial issuance from an authentication outcome
//! - Refresh token grant
//! - Refresh token revocation
//! - Access token validation
//! - JWKS export
//!
//! # Usage
//!
//! ```ignore
//! use keygate_auth::{TokenConfig, TokenService};
//!
//! let service = TokenService::new(&TokenConfig::default(), store, provider)?;
//! let pair = service.authenticate(outcome).await?;
//! let claims = service.validate(&pair.access_token).await?;
//! ```

use std::sync::Arc;

use super::claims::IdentityClaims;
use super::pipeline::{PipelineSettings, TokenPipeline};
use super::request::{RevocationRequest, TokenRequest, TokenResponse, TokenTypeHint};
use super::revocation::Revoker;
use super::validator::ClaimsValidator;
use crate::clock::{SharedClock, SystemClock};
use crate::config::TokenConfig;
use crate::identity::{AuthenticationOutcome, IdentityProvider, RequestHeaders};
use crate::keys::{Jwks, KeyRotationManager, RotationSettings};
use crate::runtime::{CryptoPool, PenaltyScheduler};
use crate::storage::{KvSessionStore, SharedSessionStore, SharedStore};
use crate::{AuthError, AuthResult};

/// The only grant served by [`TokenService::token`].
const REFRESH_TOKEN_GRANT: &str = "refresh_token";

/// Token lifecycle entry point.
pub struct TokenService {
    keys: Arc<KeyRotationManager>,
    pipeline: TokenPipeline,
    validator: ClaimsValidator,
    revoker: Revoker,
    penalty: Arc<PenaltyScheduler>,
}

impl TokenService {
    /// Builds a service on the system clock.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if `config` does not validate.
    pub fn new(
        config: &TokenConfig,
        store: SharedStore,
        identity: Arc<dyn IdentityProvider>,
    ) -> AuthResult<Self> {
        Self::with_clock(config, store, identity, Arc::new(SystemClock))
    }

    /// Builds a service on an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if `config` does not validate.
    pub fn with_clock(
        config: &TokenConfig,
        store: SharedStore,
        identity: Arc<dyn IdentityProvider>,
        clock: SharedClock,
    ) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;

        let penalty = Arc::new(PenaltyScheduler::new(config.penalty_delay)?);
        let keys = Arc::new(KeyRotationManager::new(
            store.clone(),
            clock.clone(),
            CryptoPool::new(config.crypto_workers),
            RotationSettings::from_config(config)?,
        ));
        let sessions: SharedSessionStore =
            Arc::new(KvSessionStore::new(store, config.namespace.clone()));

        let settings = PipelineSettings::from_config(config);
        let validator = ClaimsValidator::new(
            keys.clone(),
            sessions.clone(),
            penalty.clone(),
            clock.clone(),
            settings.issuer.clone(),
            settings.leeway,
            settings.compression.max_decompressed_size,
        );
        let revoker = Revoker::new(sessions.clone(), penalty.clone(), clock.clone());
        let pipeline = TokenPipeline::new(
            keys.clone(),
            sessions,
            identity,
            penalty.clone(),
            clock,
            settings,
        );

        tracing::info!(
            issuer = %config.issuer,
            namespace = %config.namespace,
            algorithm = %config.algorithm,
            "token service initialized"
        );

        Ok(Self {
            keys,
            pipeline,
            validator,
            revoker,
            penalty,
        })
    }

    /// Issues the first token pair of a new session.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidCredentials` (after the penalty delay)
    /// when the provider denied access.
    pub async fn authenticate(&self, outcome: AuthenticationOutcome) -> AuthResult<TokenResponse> {
        match outcome {
            AuthenticationOutcome::Authenticated(result) => self.pipeline.issue(result, None).await,
            AuthenticationOutcome::Denied => {
                self.penalty.apply().await;
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    /// Serves a token endpoint request.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnsupportedGrantType` for anything but the
    /// `refresh_token` grant, `AuthError::InvalidRequest` if the refresh
    /// token is missing and `AuthError::InvalidToken` if it is refused.
    pub async fn token(
        &self,
        request: &TokenRequest,
        headers: &RequestHeaders,
    ) -> AuthResult<TokenResponse> {
        if request.grant_type != REFRESH_TOKEN_GRANT {
            return Err(AuthError::unsupported_grant_type(&request.grant_type));
        }
        let refresh_token = request
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::invalid_request("refresh_token is required"))?;

        self.pipeline.refresh(refresh_token, headers).await
    }

    /// Serves a revocation request.
    ///
    /// Succeeds for any refresh token, known or not.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnsupportedTokenType` for an access token or
    /// unknown hint, and a system error if the store fails.
    pub async fn revoke(&self, request: &RevocationRequest) -> AuthResult<()> {
        match request.hint()? {
            Some(TokenTypeHint::AccessToken) => {
                Err(AuthError::unsupported_token_type(TokenTypeHint::AccessToken.as_str()))
            }
            Some(TokenTypeHint::RefreshToken) | None => self.revoker.revoke(&request.token).await,
        }
    }

    /// Validates a bearer access token.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` if the token is refused.
    pub async fn validate(&self, access_token: &str) -> AuthResult<IdentityClaims> {
        self.validator.validate(access_token).await
    }

    /// Public keys currently trusted for verification.
    ///
    /// # Errors
    ///
    /// Returns a system error if the key pool is unavailable.
    pub async fn jwks(&self) -> AuthResult<Jwks> {
        self.keys.jwks().await
    }

    /// The key rotation manager, for starting the populator.
    #[must_use]
    pub fn key_manager(&self) -> Arc<KeyRotationManager> {
        self.keys.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use time::OffsetDateTime;

    use super::*;
    use crate::identity::AuthenticationResult;
    use crate::storage::MemoryStore;
    use crate::token::claims::SecretClaims;

    /// Mock identity provider returning scripted outcomes.
    struct MockIdentityProvider {
        outcomes: Mutex<VecDeque<AuthenticationOutcome>>,
        calls: Mutex<Vec<SecretClaims>>,
    }

    impl MockIdentityProvider {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, outcome: AuthenticationOutcome) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl IdentityProvider for MockIdentityProvider {
        async fn refresh(
            &self,
            secret_claims: &SecretClaims,
            _issued_on: OffsetDateTime,
            _headers: &RequestHeaders,
        ) -> AuthResult<AuthenticationOutcome> {
            self.calls.lock().unwrap().push(secret_claims.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AuthError::identity_provider("no scripted outcome"))
        }
    }

    fn test_config() -> TokenConfig {
        let mut config = TokenConfig {
            issuer: "https://gw.test".to_string(),
            namespace: "svc".to_string(),
            penalty_delay: Duration::ZERO,
            crypto_workers: 2,
            ..TokenConfig::default()
        };
        config.lifetimes.min_access_age_before_refresh = Duration::ZERO;
        config.rotation.keys_per_block = 2;
        config
    }

    fn create_test_service(config: &TokenConfig) -> (TokenService, Arc<MockIdentityProvider>) {
        let provider = Arc::new(MockIdentityProvider::new());
        let service =
            TokenService::new(config, Arc::new(MemoryStore::new()), provider.clone()).unwrap();
        (service, provider)
    }

    fn authenticated(sub: &str) -> AuthenticationOutcome {
        AuthenticationOutcome::Authenticated(AuthenticationResult::new(
            IdentityClaims::new(sub),
            SecretClaims::default().with_claim("upstream_token", "u-1"),
        ))
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.issuer = String::new();
        let result = TokenService::new(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(MockIdentityProvider::new()),
        );
        assert!(matches!(result, Err(AuthError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_authenticate_then_validate() {
        let (service, _) = create_test_service(&test_config());
        let pair = service.authenticate(authenticated("alice")).await.unwrap();

        let claims = service.validate(&pair.access_token).await.unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.iss.as_deref(), Some("https://gw.test"));
    }

    #[tokio::test]
    async fn test_authenticate_denied() {
        let (service, _) = create_test_service(&test_config());
        let err = service
            .authenticate(AuthenticationOutcome::Denied)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }

    #[tokio::test]
    async fn test_refresh_passes_secret_claims_to_provider() {
        let (service, provider) = create_test_service(&test_config());
        let pair = service.authenticate(authenticated("alice")).await.unwrap();

        provider.push(authenticated("alice"));
        let refreshed = service
            .token(&TokenRequest::refresh(&pair.refresh_token), &RequestHeaders::new())
            .await
            .unwrap();

        assert_ne!(refreshed.refresh_token, pair.refresh_token);
        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls[0].extra["upstream_token"], "u-1");
    }

    #[tokio::test]
    async fn test_refresh_denied_is_invalid_token() {
        let (service, provider) = create_test_service(&test_config());
        let pair = service.authenticate(authenticated("alice")).await.unwrap();

        provider.push(AuthenticationOutcome::Denied);
        let err = service
            .token(&TokenRequest::refresh(&pair.refresh_token), &RequestHeaders::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
    }

    #[tokio::test]
    async fn test_unsupported_grant_type() {
        let (service, _) = create_test_service(&test_config());
        let request = TokenRequest {
            grant_type: "password".to_string(),
            refresh_token: None,
        };
        let err = service.token(&request, &RequestHeaders::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::UnsupportedGrantType { .. }));
    }

    #[tokio::test]
    async fn test_missing_refresh_token() {
        let (service, _) = create_test_service(&test_config());
        let request = TokenRequest {
            grant_type: "refresh_token".to_string(),
            refresh_token: None,
        };
        let err = service.token(&request, &RequestHeaders::new()).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_revoke_rejects_access_token_hint() {
        let (service, _) = create_test_service(&test_config());
        let request = RevocationRequest {
            token: "whatever".to_string(),
            token_type_hint: Some("access_token".to_string()),
        };
        let err = service.revoke(&request).await.unwrap_err();
        assert!(err.is_validation_error());
    }

    #[tokio::test]
    async fn test_revoke_kills_access_token() {
        let (service, provider) = create_test_service(&test_config());
        let pair = service.authenticate(authenticated("alice")).await.unwrap();

        service
            .revoke(&RevocationRequest::refresh_token(&pair.refresh_token))
            .await
            .unwrap();

        assert!(matches!(
            service.validate(&pair.access_token).await,
            Err(AuthError::InvalidToken)
        ));
        let err = service
            .token(&TokenRequest::refresh(&pair.refresh_token), &RequestHeaders::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_jwks_exposes_pool() {
        let (service, _) = create_test_service(&test_config());
        service.authenticate(authenticated("alice")).await.unwrap();

        let jwks = service.jwks().await.unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert!(jwks.keys.iter().all(|k| k.alg == "ES384"));
    }
}
