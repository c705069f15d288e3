//! Token issuance and refresh pipeline.
//!
//! Issuance runs a fixed sequence of stages over an [`IssueContext`]. Each
//! stage takes the context by value and returns an updated copy; nothing is
//! written to the store until the last stage, so a failure anywhere earlier
//! leaves no trace.
//!
//! ```text
//! resolve session -> lifetimes -> draw keys -> stamp claims
//!   -> refresh claims -> sign -> session record -> persist
//! ```

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use super::access::{CompressionPolicy, encode_access_token};
use super::claims::{IdentityClaims, RefreshClaims, SecretClaims};
use super::refresh::{encode_refresh_token, fingerprint, resolve_session};
use super::request::TokenResponse;
use crate::clock::SharedClock;
use crate::config::TokenConfig;
use crate::identity::{AuthenticationOutcome, AuthenticationResult, IdentityProvider, RequestHeaders};
use crate::keys::{KeyRotationManager, SigningKeyPair};
use crate::runtime::{PenaltyScheduler, run_detached};
use crate::storage::{RecentIssue, Session, SharedSessionStore};
use crate::{AuthError, AuthResult};

/// Pipeline settings derived from [`TokenConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Issuer stamped into access tokens.
    pub issuer: String,
    /// Default access token lifetime.
    pub access_lifetime: Duration,
    /// Default refresh token lifetime.
    pub refresh_lifetime: Duration,
    /// Window in which a refresh returns the current pair.
    pub min_access_age: Duration,
    /// Allowed clock skew in seconds.
    pub leeway: i64,
    /// Access token compression.
    pub compression: CompressionPolicy,
}

impl PipelineSettings {
    /// Extracts pipeline settings from a configuration.
    #[must_use]
    pub fn from_config(config: &TokenConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            access_lifetime: config.lifetimes.access_token,
            refresh_lifetime: config.lifetimes.refresh_token,
            min_access_age: config.lifetimes.min_access_age_before_refresh,
            leeway: i64::try_from(config.lifetimes.allowed_clock_skew.as_secs()).unwrap_or(i64::MAX),
            compression: CompressionPolicy {
                enabled: config.compression.enabled,
                max_jwt_size: config.compression.max_jwt_size,
                max_decompressed_size: config.compression.max_decompressed_size,
            },
        }
    }
}

/// Token lifetimes in seconds for one issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetimes {
    /// Access token lifetime.
    pub access: u64,
    /// Refresh token lifetime, also the session TTL.
    pub refresh: u64,
}

// ============================================================================
// Issue Context
// ============================================================================

/// Accumulated state of one issuance.
///
/// Cloning is cheap: claims and keys are shared. Every `with_*` method
/// returns a new context and leaves `self` untouched.
#[derive(Clone)]
pub struct IssueContext {
    now: OffsetDateTime,
    session_id: Option<String>,
    issued_on: OffsetDateTime,
    replaces: Option<String>,
    claims: Arc<IdentityClaims>,
    secret_claims: Arc<SecretClaims>,
    lifetimes: Option<Lifetimes>,
    access_key: Option<Arc<SigningKeyPair>>,
    refresh_key: Option<Arc<SigningKeyPair>>,
    refresh_claims: Option<RefreshClaims>,
    response: Option<TokenResponse>,
    session: Option<Arc<Session>>,
}

impl IssueContext {
    /// Starts a context for `result` at `now`.
    #[must_use]
    pub fn new(result: AuthenticationResult, now: OffsetDateTime) -> Self {
        Self {
            now,
            session_id: None,
            issued_on: now,
            replaces: None,
            claims: Arc::new(result.claims),
            secret_claims: Arc::new(result.secret_claims),
            lifetimes: None,
            access_key: None,
            refresh_key: None,
            refresh_claims: None,
            response: None,
            session: None,
        }
    }

    /// Sets the session identity.
    #[must_use]
    pub fn with_session(
        &self,
        session_id: String,
        issued_on: OffsetDateTime,
        replaces: Option<String>,
    ) -> Self {
        Self {
            session_id: Some(session_id),
            issued_on,
            replaces,
            ..self.clone()
        }
    }

    /// Sets the token lifetimes.
    #[must_use]
    pub fn with_lifetimes(&self, lifetimes: Lifetimes) -> Self {
        Self {
            lifetimes: Some(lifetimes),
            ..self.clone()
        }
    }

    /// Sets the access and refresh signing keys.
    #[must_use]
    pub fn with_keys(&self, access: Arc<SigningKeyPair>, refresh: Arc<SigningKeyPair>) -> Self {
        Self {
            access_key: Some(access),
            refresh_key: Some(refresh),
            ..self.clone()
        }
    }

    /// Replaces the public claims.
    #[must_use]
    pub fn with_claims(&self, claims: IdentityClaims) -> Self {
        Self {
            claims: Arc::new(claims),
            ..self.clone()
        }
    }

    /// Sets the refresh token payload.
    #[must_use]
    pub fn with_refresh_claims(&self, claims: RefreshClaims) -> Self {
        Self {
            refresh_claims: Some(claims),
            ..self.clone()
        }
    }

    /// Sets the signed token pair.
    #[must_use]
    pub fn with_response(&self, response: TokenResponse) -> Self {
        Self {
            response: Some(response),
            ..self.clone()
        }
    }

    /// Sets the session record to persist.
    #[must_use]
    pub fn with_session_record(&self, session: Session) -> Self {
        Self {
            session: Some(Arc::new(session)),
            ..self.clone()
        }
    }

    /// The issuance time.
    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.now
    }

    /// The public claims as they currently stand.
    #[must_use]
    pub fn claims(&self) -> &IdentityClaims {
        &self.claims
    }

    /// The secret claims.
    #[must_use]
    pub fn secret_claims(&self) -> &SecretClaims {
        &self.secret_claims
    }

    /// The resolved lifetimes, once determined.
    #[must_use]
    pub fn lifetimes(&self) -> Option<Lifetimes> {
        self.lifetimes
    }

    /// The session id, once resolved.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

fn stage_input<'a, T>(value: &'a Option<T>, what: &str) -> AuthResult<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| AuthError::internal(format!("issue pipeline: {what} not set")))
}

fn seconds(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

// ============================================================================
// Pipeline
// ============================================================================

/// Turns authentication results into persisted token pairs.
pub struct TokenPipeline {
    keys: Arc<KeyRotationManager>,
    sessions: SharedSessionStore,
    identity: Arc<dyn IdentityProvider>,
    penalty: Arc<PenaltyScheduler>,
    clock: SharedClock,
    settings: PipelineSettings,
}

impl TokenPipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        keys: Arc<KeyRotationManager>,
        sessions: SharedSessionStore,
        identity: Arc<dyn IdentityProvider>,
        penalty: Arc<PenaltyScheduler>,
        clock: SharedClock,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            keys,
            sessions,
            identity,
            penalty,
            clock,
            settings,
        }
    }

    /// Issues a token pair for `result`.
    ///
    /// With `existing_session_id` the new session replaces that one: it
    /// keeps the original `issued_on`, gets a fresh id, and the old record is
    /// deleted once the new one is stored. If that delete fails the new
    /// record is withdrawn again and the store error returned.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` if the existing session is gone,
    /// `AuthError::InvalidRequest` for unusable claims and a system error if
    /// signing or the store fails.
    pub async fn issue(
        &self,
        result: AuthenticationResult,
        existing_session_id: Option<&str>,
    ) -> AuthResult<TokenResponse> {
        let ctx = IssueContext::new(result, self.clock.now());

        // 1. Resolve session
        let ctx = self.resolve_session(ctx, existing_session_id).await?;
        // 2. Determine lifetimes
        let ctx = self.determine_lifetimes(ctx)?;
        // 3. Draw independent access and refresh keys
        let ctx = self.draw_keys(ctx).await?;
        // 4. Stamp system claims
        let ctx = self.stamp_claims(ctx)?;
        // 5. Minimal refresh claims
        let ctx = self.build_refresh_claims(ctx)?;
        // 6. Sign both tokens
        let ctx = self.sign_tokens(ctx).await?;
        // 7. Session record
        let ctx = self.build_session(ctx)?;
        // 8. Persist, last
        self.persist(ctx).await
    }

    /// Refreshes a token pair.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` (after the penalty delay) for any
    /// unusable refresh token or a provider refusal, and a system error if
    /// the store or provider is unavailable.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        headers: &RequestHeaders,
    ) -> AuthResult<TokenResponse> {
        let now = self.clock.now();
        let resolved = resolve_session(
            self.sessions.as_ref(),
            refresh_token,
            now,
            Some(self.settings.leeway),
        )
        .await?;

        let session = match resolved {
            Ok(session) => session,
            Err(rejection) => {
                tracing::debug!(
                    reason = rejection.reason(),
                    detail = %rejection,
                    token = %fingerprint(refresh_token),
                    "refresh token rejected"
                );
                self.penalty.apply().await;
                return Err(AuthError::InvalidToken);
            }
        };

        if let Some(recent) = self.sessions.recent_issue(&session.id).await? {
            tracing::debug!(
                session_id = %session.id,
                "access token below minimum refresh age, returning current pair"
            );
            self.penalty.apply().await;
            return Ok(recent.into_response(now));
        }

        let outcome = self
            .identity
            .refresh(&session.secret_claims, session.issued_on, headers)
            .await?;

        match outcome {
            AuthenticationOutcome::Authenticated(result) => {
                self.issue(result, Some(&session.id)).await
            }
            AuthenticationOutcome::Denied => {
                tracing::info!(session_id = %session.id, "identity provider denied refresh");
                self.penalty.apply().await;
                Err(AuthError::InvalidToken)
            }
        }
    }

    async fn resolve_session(
        &self,
        ctx: IssueContext,
        existing_session_id: Option<&str>,
    ) -> AuthResult<IssueContext> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let Some(existing_id) = existing_session_id else {
            return Ok(ctx.with_session(session_id, ctx.now(), None));
        };

        match self.sessions.get(existing_id).await? {
            Some(existing) => Ok(ctx.with_session(session_id, existing.issued_on, Some(existing.id))),
            None => {
                tracing::debug!(session_id = %existing_id, "session vanished before reissue");
                Err(AuthError::InvalidToken)
            }
        }
    }

    fn determine_lifetimes(&self, ctx: IssueContext) -> AuthResult<IssueContext> {
        let access = self.settings.access_lifetime.as_secs();
        let refresh = self.settings.refresh_lifetime.as_secs();

        let lifetimes = match ctx.secret_claims().expires_in {
            Some(0) => {
                return Err(AuthError::invalid_request("expires_in must be positive"));
            }
            Some(cap) => Lifetimes {
                access: access.min(cap),
                refresh: refresh.min(cap),
            },
            None => Lifetimes { access, refresh },
        };

        Ok(ctx.with_lifetimes(lifetimes))
    }

    async fn draw_keys(&self, ctx: IssueContext) -> AuthResult<IssueContext> {
        let lifetimes = *stage_input(&ctx.lifetimes, "lifetimes")?;
        let lifetime = Duration::from_secs(lifetimes.access);

        let access = self.keys.signing_key(lifetime).await?;
        let refresh = self.keys.signing_key(lifetime).await?;
        Ok(ctx.with_keys(access, refresh))
    }

    fn stamp_claims(&self, ctx: IssueContext) -> AuthResult<IssueContext> {
        let lifetimes = stage_input(&ctx.lifetimes, "lifetimes")?;
        let session_id = stage_input(&ctx.session_id, "session id")?;

        if ctx.claims().sub.is_empty() {
            return Err(AuthError::invalid_request("identity claims need a subject"));
        }

        let mut claims = ctx.claims().clone();
        claims.iss = Some(self.settings.issuer.clone());
        claims.jti = Some(session_id.clone());
        claims.iat = Some(ctx.now().unix_timestamp());
        claims.exp = Some(ctx.now().unix_timestamp() + seconds(lifetimes.access));
        Ok(ctx.with_claims(claims))
    }

    fn build_refresh_claims(&self, ctx: IssueContext) -> AuthResult<IssueContext> {
        let lifetimes = stage_input(&ctx.lifetimes, "lifetimes")?;
        let session_id = stage_input(&ctx.session_id, "session id")?;

        let claims = RefreshClaims {
            jti: session_id.clone(),
            exp: ctx.now().unix_timestamp() + seconds(lifetimes.refresh),
        };
        Ok(ctx.with_refresh_claims(claims))
    }

    async fn sign_tokens(&self, ctx: IssueContext) -> AuthResult<IssueContext> {
        let lifetimes = *stage_input(&ctx.lifetimes, "lifetimes")?;
        let access_key = stage_input(&ctx.access_key, "access key")?.clone();
        let refresh_key = stage_input(&ctx.refresh_key, "refresh key")?.clone();
        let refresh_claims = stage_input(&ctx.refresh_claims, "refresh claims")?.clone();
        let claims = ctx.claims.clone();
        let policy = self.settings.compression;

        let pool = self.keys.crypto_pool();
        let (access_token, refresh_token) = tokio::try_join!(
            pool.run(move || encode_access_token(&access_key, &claims, &policy)),
            pool.run(move || encode_refresh_token(&refresh_key, &refresh_claims)),
        )?;

        Ok(ctx.with_response(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: lifetimes.access,
            refresh_token,
        }))
    }

    fn build_session(&self, ctx: IssueContext) -> AuthResult<IssueContext> {
        let lifetimes = stage_input(&ctx.lifetimes, "lifetimes")?;
        let session_id = stage_input(&ctx.session_id, "session id")?;
        let refresh_key = stage_input(&ctx.refresh_key, "refresh key")?;

        let session = Session {
            id: session_id.clone(),
            issued_on: ctx.issued_on,
            ttl: lifetimes.refresh,
            secret_claims: ctx.secret_claims().clone(),
            refresh_key: refresh_key.to_jwk(),
        };
        Ok(ctx.with_session_record(session))
    }

    async fn persist(&self, ctx: IssueContext) -> AuthResult<TokenResponse> {
        let session = stage_input(&ctx.session, "session record")?.clone();
        let response = stage_input(&ctx.response, "tokens")?.clone();
        let lifetimes = *stage_input(&ctx.lifetimes, "lifetimes")?;

        let recent = (!self.settings.min_access_age.is_zero()).then(|| RecentIssue {
            response: response.clone(),
            access_expires_at: ctx.now().unix_timestamp() + seconds(lifetimes.access),
        });
        let min_access_age = self.settings.min_access_age;
        let replaces = ctx.replaces.clone();
        let sessions = self.sessions.clone();

        // Runs to completion even if the caller disconnects.
        run_detached(async move {
            if let Some(recent) = recent {
                sessions
                    .put_recent_issue(&session.id, &recent, min_access_age)
                    .await?;
            }
            sessions
                .put(&session, Duration::from_secs(lifetimes.refresh))
                .await?;
            if let Some(old) = replaces {
                // The old refresh token must not outlive a failed rotation
                // alongside the new one.
                if let Err(e) = sessions.delete(&old).await {
                    tracing::warn!(
                        old_session = %old,
                        new_session = %session.id,
                        error = %e,
                        "failed to retire replaced session, withdrawing the new one"
                    );
                    if let Err(undo) = sessions.delete(&session.id).await {
                        tracing::error!(
                            session_id = %session.id,
                            error = %undo,
                            "failed to withdraw new session"
                        );
                    }
                    return Err(e);
                }
                tracing::debug!(old_session = %old, new_session = %session.id, "session rotated");
            }
            Ok(())
        })
        .await?;

        tracing::debug!(
            session_id = %ctx.session_id().unwrap_or_default(),
            expires_in = lifetimes.access,
            "issued token pair"
        );
        Ok(response)
    }
}
