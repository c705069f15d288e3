//! Token issuance, refresh, validation and revocation.

pub mod access;
pub mod claims;
pub mod pipeline;
pub mod refresh;
pub mod request;
pub mod revocation;
pub mod service;
pub mod validator;

pub use access::{AccessTokenRules, CompressionPolicy, decode_access_token, encode_access_token};
pub use claims::{IdentityClaims, RefreshClaims, SecretClaims};
pub use pipeline::{IssueContext, PipelineSettings, TokenPipeline};
pub use refresh::{UnverifiedRefreshToken, encode_refresh_token, fingerprint, resolve_session};
pub use request::{RevocationRequest, TokenRequest, TokenResponse, TokenTypeHint};
pub use revocation::Revoker;
pub use service::TokenService;
pub use validator::ClaimsValidator;

/// Why a token was refused.
///
/// Only ever logged. Callers see [`AuthError::InvalidToken`](crate::AuthError::InvalidToken).
#[derive(Debug, thiserror::Error)]
pub enum TokenRejection {
    /// The token could not be parsed or decompressed.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The key id is not in the trusted set.
    #[error("unknown signing key {0}")]
    UnknownKey(String),

    /// The signature does not verify.
    #[error("signature verification failed")]
    BadSignature,

    /// A required claim is missing or wrong.
    #[error("invalid claims: {0}")]
    Claims(String),

    /// The token is past its expiry plus clock skew.
    #[error("token expired")]
    Expired,

    /// The session the token names no longer exists.
    #[error("session not found")]
    NoSession,
}

impl TokenRejection {
    /// Short label for structured logs.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownKey(_) => "unknown_key",
            Self::BadSignature => "bad_signature",
            Self::Claims(_) => "claims",
            Self::Expired => "expired",
            Self::NoSession => "no_session",
        }
    }
}
