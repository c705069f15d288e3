//! Backend identity provider seam.
//!
//! The engine never decides whether a user is authenticated. The initial
//! authentication result is handed to [`TokenService::authenticate`] already
//! resolved; on refresh the provider is asked again with the session's
//! secret claims.
//!
//! [`TokenService::authenticate`]: crate::token::TokenService::authenticate

use std::collections::BTreeMap;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::token::claims::{IdentityClaims, SecretClaims};

/// Request headers forwarded to the provider, lower-cased names.
pub type RequestHeaders = BTreeMap<String, String>;

/// Claims produced by a successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticationResult {
    /// Public claims for the access token.
    pub claims: IdentityClaims,
    /// Server-side claims for the session.
    pub secret_claims: SecretClaims,
}

impl AuthenticationResult {
    /// Bundles public and secret claims.
    #[must_use]
    pub fn new(claims: IdentityClaims, secret_claims: SecretClaims) -> Self {
        Self {
            claims,
            secret_claims,
        }
    }
}

/// The provider's verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthenticationOutcome {
    /// The user is (still) authenticated.
    Authenticated(AuthenticationResult),
    /// The provider refused.
    Denied,
}

/// Backend identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Re-authenticates a session on refresh.
    ///
    /// # Arguments
    ///
    /// * `secret_claims` - The session's secret claims snapshot
    /// * `issued_on` - When the session was first authenticated
    /// * `headers` - Headers of the refresh request
    ///
    /// # Errors
    ///
    /// Returns `AuthError::IdentityProvider` if the provider is unreachable.
    /// A refusal is `Ok(AuthenticationOutcome::Denied)`, not an error.
    async fn refresh(
        &self,
        secret_claims: &SecretClaims,
        issued_on: OffsetDateTime,
        headers: &RequestHeaders,
    ) -> AuthResult<AuthenticationOutcome>;
}
