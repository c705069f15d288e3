//! Token and revocation request/response types.
//!
//! These mirror the OAuth 2.0 token (RFC 6749 §5) and revocation
//! (RFC 7009) wire shapes so an HTTP layer can deserialize straight into
//! them. Only the `refresh_token` grant is served here; initial issuance
//! goes through [`TokenService::authenticate`](super::TokenService::authenticate).

use serde::{Deserialize, Serialize};

use crate::{AuthError, AuthResult};

/// Token endpoint request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// OAuth 2.0 grant type. Only `refresh_token` is accepted.
    pub grant_type: String,

    /// Refresh token (for refresh_token grant).
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenRequest {
    /// Builds a `refresh_token` grant request.
    #[must_use]
    pub fn refresh(refresh_token: impl Into<String>) -> Self {
        Self {
            grant_type: "refresh_token".to_string(),
            refresh_token: Some(refresh_token.into()),
        }
    }
}

/// Successful token response.
///
/// # Example Response
///
/// ```json
/// {
///   "access_token": "eyJhbG...",
///   "token_type": "Bearer",
///   "expires_in": 900,
///   "refresh_token": "3f1c...kid.eyJqdGki...sig"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The access token (JWT, possibly compressed).
    pub access_token: String,

    /// Token type, always "Bearer".
    pub token_type: String,

    /// Access token lifetime in seconds.
    pub expires_in: u64,

    /// The refresh token.
    pub refresh_token: String,
}

/// Token revocation request per RFC 7009.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RevocationRequest {
    /// The token to revoke.
    pub token: String,

    /// Optional hint about the token type.
    #[serde(default)]
    pub token_type_hint: Option<String>,
}

impl RevocationRequest {
    /// Builds a request for a refresh token.
    #[must_use]
    pub fn refresh_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            token_type_hint: Some(TokenTypeHint::RefreshToken.as_str().to_string()),
        }
    }

    /// Parses the hint.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnsupportedTokenType` for unrecognised hints.
    pub fn hint(&self) -> AuthResult<Option<TokenTypeHint>> {
        self.token_type_hint
            .as_deref()
            .map(TokenTypeHint::parse)
            .transpose()
    }
}

/// Token type hint for revocation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    /// The token is an access token.
    AccessToken,
    /// The token is a refresh token.
    RefreshToken,
}

impl TokenTypeHint {
    /// Parses an RFC 7009 hint.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnsupportedTokenType` for anything else.
    pub fn parse(hint: &str) -> AuthResult<Self> {
        match hint {
            "access_token" => Ok(Self::AccessToken),
            "refresh_token" => Ok(Self::RefreshToken),
            other => Err(AuthError::unsupported_token_type(other)),
        }
    }

    /// Returns the token type hint as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
        }
    }
}

impl std::fmt::Display for TokenTypeHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
