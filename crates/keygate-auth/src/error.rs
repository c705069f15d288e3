//! Token lifecycle error types.
//!
//! Errors fall into three categories. Validation errors describe a
//! malformed request shape, security errors cover every signature, claim
//! or session-liveness failure, and system errors mean the store or the
//! signing infrastructure is unavailable.
//!
//! Security failures are intentionally coarse: [`AuthError::InvalidToken`]
//! carries no detail, so a caller probing with forged tokens learns nothing
//! about which check rejected them. Detail is logged at `debug` before the
//! error is constructed.

use std::fmt;

/// Errors produced by the token lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request is malformed or missing a required parameter.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// The requested grant type is not handled by this engine.
    #[error("Unsupported grant type: {grant_type}")]
    UnsupportedGrantType {
        /// The unsupported grant type.
        grant_type: String,
    },

    /// The token type hint is not accepted for this operation.
    #[error("Unsupported token type: {token_type}")]
    UnsupportedTokenType {
        /// The rejected hint.
        token_type: String,
    },

    /// The token failed verification. Deliberately detail-free.
    #[error("Invalid token")]
    InvalidToken,

    /// The identity provider rejected the authentication attempt.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The session or key-block store failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Key generation, signing or key parsing failed.
    #[error("Crypto error: {message}")]
    Crypto {
        /// Description of the crypto failure.
        message: String,
    },

    /// The configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// The backend identity provider could not be reached.
    #[error("Identity provider error: {message}")]
    IdentityProvider {
        /// Description of the provider failure.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an unsupported grant type error.
    #[must_use]
    pub fn unsupported_grant_type(grant_type: impl Into<String>) -> Self {
        Self::UnsupportedGrantType {
            grant_type: grant_type.into(),
        }
    }

    /// Creates an unsupported token type error.
    #[must_use]
    pub fn unsupported_token_type(token_type: impl Into<String>) -> Self {
        Self::UnsupportedTokenType {
            token_type: token_type.into(),
        }
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a crypto error.
    #[must_use]
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an identity provider error.
    #[must_use]
    pub fn identity_provider(message: impl Into<String>) -> Self {
        Self::IdentityProvider {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidRequest { .. }
            | Self::UnsupportedGrantType { .. }
            | Self::UnsupportedTokenType { .. } => ErrorCategory::Validation,
            Self::InvalidToken | Self::InvalidCredentials => ErrorCategory::Security,
            Self::Storage { .. }
            | Self::Crypto { .. }
            | Self::Configuration { .. }
            | Self::IdentityProvider { .. }
            | Self::Internal { .. } => ErrorCategory::System,
        }
    }

    /// Returns true if the request itself was malformed.
    #[must_use]
    pub fn is_validation_error(&self) -> bool {
        self.category() == ErrorCategory::Validation
    }

    /// Returns true for the opaque security rejections.
    #[must_use]
    pub fn is_security_error(&self) -> bool {
        self.category() == ErrorCategory::Security
    }

    /// Returns true if infrastructure failed and the caller may retry.
    #[must_use]
    pub fn is_system_error(&self) -> bool {
        self.category() == ErrorCategory::System
    }

    /// Returns the OAuth 2.0 error code for the wire response.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::UnsupportedGrantType { .. } => "unsupported_grant_type",
            Self::UnsupportedTokenType { .. } => "unsupported_token_type",
            Self::InvalidToken => "invalid_token",
            Self::InvalidCredentials => "invalid_grant",
            _ => "server_error",
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {err}"))
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("Worker task failed: {err}"))
    }
}

/// Result type for token lifecycle operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Error categories used for response mapping and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed request shape.
    Validation,
    /// Signature, claims or session-liveness failure.
    Security,
    /// Store or signing infrastructure unavailable.
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Security => write!(f, "security"),
            Self::System => write!(f, "system"),
        }
    }
}
