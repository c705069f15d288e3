//! Token lifecycle configuration.
//!
//! The engine consumes this configuration but does not own where it comes
//! from; the server crate layers it from a TOML file and the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::keys::SigningAlgorithm;

/// Largest accepted `rotation.block_size`; keeps block arithmetic in range.
pub const MAX_BLOCK_SIZE: Duration = Duration::from_secs(366 * 24 * 3600);

/// Root configuration for token issuance, validation and key rotation.
///
/// # Example (TOML)
///
/// ```toml
/// [tokens]
/// issuer = "https://gateway.example.com"
/// namespace = "keygate"
///
/// [tokens.lifetimes]
/// access_token = "15m"
/// refresh_token = "30d"
///
/// [tokens.rotation]
/// block_size = "6h"
/// keys_per_block = 3
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Issuer stamped into every access token (`iss`).
    pub issuer: String,

    /// Prefix for every store key owned by the engine.
    pub namespace: String,

    /// Signing algorithm for generated key pairs: ES384, RS256 or RS384.
    pub algorithm: String,

    /// Token lifetimes and refresh policy.
    pub lifetimes: LifetimeConfig,

    /// Signing-key rotation.
    pub rotation: RotationConfig,

    /// Access token compression.
    pub compression: CompressionConfig,

    /// Delay applied to invalid-token, invalid-credential and revoke paths.
    #[serde(with = "humantime_serde")]
    pub penalty_delay: Duration,

    /// Upper bound on concurrent CPU-bound crypto jobs.
    pub crypto_workers: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".to_string(),
            namespace: "keygate".to_string(),
            algorithm: "ES384".to_string(),
            lifetimes: LifetimeConfig::default(),
            rotation: RotationConfig::default(),
            compression: CompressionConfig::default(),
            penalty_delay: Duration::from_millis(250),
            crypto_workers: num_cpus::get().max(1),
        }
    }
}

/// Token lifetimes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifetimeConfig {
    /// Access token lifetime.
    #[serde(with = "humantime_serde")]
    pub access_token: Duration,

    /// Refresh token lifetime. Also the session TTL.
    #[serde(with = "humantime_serde")]
    pub refresh_token: Duration,

    /// Access tokens younger than this are returned unchanged on refresh.
    #[serde(with = "humantime_serde")]
    pub min_access_age_before_refresh: Duration,

    /// Tolerance applied to `exp` checks.
    #[serde(with = "humantime_serde")]
    pub allowed_clock_skew: Duration,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        Self {
            access_token: Duration::from_secs(15 * 60),
            refresh_token: Duration::from_secs(30 * 24 * 3600),
            min_access_age_before_refresh: Duration::from_secs(30),
            allowed_clock_skew: Duration::from_secs(30),
        }
    }
}

/// Signing-key rotation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Width of one signing-key block.
    #[serde(with = "humantime_serde")]
    pub block_size: Duration,

    /// Number of key pairs generated per block.
    pub keys_per_block: usize,

    /// How often the background populator checks the current and next block.
    #[serde(with = "humantime_serde")]
    pub populate_interval: Duration,

    /// Maximum age of the cached verification key set.
    #[serde(with = "humantime_serde")]
    pub verification_cache_ttl: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            block_size: Duration::from_secs(6 * 3600),
            keys_per_block: 3,
            populate_interval: Duration::from_secs(60),
            verification_cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Access token compression settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress access tokens larger than `max_jwt_size`.
    pub enabled: bool,

    /// Signed token length (bytes) above which compression kicks in.
    pub max_jwt_size: usize,

    /// Hard cap on decompressed output size.
    pub max_decompressed_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_jwt_size: 4096,
            max_decompressed_size: 20 * 1024,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl TokenConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - The issuer or namespace is empty
    /// - The signing algorithm is not supported
    /// - Any lifetime, block size or key count is zero
    /// - Access tokens could outlive the two-block verification window
    /// - The decompression cap is smaller than the compression threshold
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.is_empty() {
            return Err(ConfigError::Missing("issuer".to_string()));
        }
        if self.namespace.is_empty() {
            return Err(ConfigError::Missing("namespace".to_string()));
        }

        self.signing_algorithm()?;

        if self.lifetimes.access_token.is_zero() || self.lifetimes.refresh_token.is_zero() {
            return Err(ConfigError::InvalidValue(
                "token lifetimes must be > 0".to_string(),
            ));
        }

        if self.rotation.block_size.as_secs() == 0 {
            return Err(ConfigError::InvalidValue(
                "rotation.block_size must be at least one second".to_string(),
            ));
        }
        if self.rotation.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::InvalidValue(format!(
                "rotation.block_size must not exceed {MAX_BLOCK_SIZE:?}"
            )));
        }

        if self.rotation.keys_per_block == 0 {
            return Err(ConfigError::InvalidValue(
                "rotation.keys_per_block must be > 0".to_string(),
            ));
        }

        if self.rotation.populate_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "rotation.populate_interval must be > 0".to_string(),
            ));
        }

        // Verification only trusts the previous and current block.
        let window = self
            .lifetimes
            .access_token
            .saturating_add(self.lifetimes.allowed_clock_skew);
        if window > self.rotation.block_size {
            return Err(ConfigError::InvalidValue(format!(
                "access token lifetime plus clock skew ({window:?}) must not exceed rotation.block_size ({:?})",
                self.rotation.block_size
            )));
        }

        if self.compression.max_decompressed_size < self.compression.max_jwt_size {
            return Err(ConfigError::InvalidValue(
                "compression.max_decompressed_size must be >= compression.max_jwt_size"
                    .to_string(),
            ));
        }

        if self.crypto_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "crypto_workers must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parses the configured signing algorithm.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for anything other than
    /// ES384, RS256 or RS384.
    pub fn signing_algorithm(&self) -> Result<SigningAlgorithm, ConfigError> {
        self.algorithm.parse().map_err(|_| {
            ConfigError::InvalidValue(format!(
                "Invalid signing algorithm: '{}'. Must be ES384, RS256, or RS384",
                self.algorithm
            ))
        })
    }
}
