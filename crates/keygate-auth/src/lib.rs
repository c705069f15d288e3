//! # keygate-auth
//!
//! Token lifecycle and signing-key rotation engine for the Keygate API
//! gateway.
//!
//! This crate provides:
//! - Access token issuance, validation and transparent compression
//! - Refresh token rotation with per-session pinned keys
//! - Time-blocked signing-key pools shared across instances
//! - Session revocation
//!
//! ## Modules
//!
//! - [`codec`] - Access token compression
//! - [`keys`] - Signing keys, block arithmetic and the rotation manager
//! - [`token`] - Issuance pipeline, validation and revocation
//! - [`storage`] - Key-value store and session storage
//! - [`identity`] - Backend identity provider seam
//! - [`runtime`] - Crypto worker pool and penalty scheduler
//! - [`config`] - Engine configuration

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod runtime;
pub mod storage;
pub mod token;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CompressionConfig, ConfigError, LifetimeConfig, RotationConfig, TokenConfig};
pub use error::{AuthError, AuthResult, ErrorCategory};
pub use identity::{AuthenticationOutcome, AuthenticationResult, IdentityProvider, RequestHeaders};
pub use keys::{
    Jwk, Jwks, KeyRotationManager, PopulatorHandle, SigningAlgorithm, SigningKeyPair,
};
pub use storage::{KeyValueStore, MemoryStore, Session, SessionStore, SharedStore};
pub use token::{
    ClaimsValidator, IdentityClaims, RevocationRequest, SecretClaims, TokenRequest, TokenResponse,
    TokenService, TokenTypeHint,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use keygate_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::config::{ConfigError, TokenConfig};
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::identity::{
        AuthenticationOutcome, AuthenticationResult, IdentityProvider, RequestHeaders,
    };
    pub use crate::storage::{KeyValueStore, MemoryStore, SharedStore};
    pub use crate::token::{
        IdentityClaims, RevocationRequest, SecretClaims, TokenRequest, TokenResponse, TokenService,
    };
}
