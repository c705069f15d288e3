//! Signing key pairs, their stored form and JWK export.
//!
//! Key pairs are generated in-process and persisted to the key-block store as
//! [`StoredSigningKey`] JSON records: the PKCS#8 private key for signers and
//! the public JWK for verifiers. Verifiers never parse private key material.
//!
//! ## Supported Algorithms
//!
//! - **ES384**: ECDSA with P-384 curve (default, fast key generation)
//! - **RS256**: RSA with SHA-256
//! - **RS384**: RSA with SHA-384

use std::fmt;
use std::str::FromStr;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use p384::SecretKey as EcSecretKey;
use p384::ecdsa::SigningKey as EcSigningKey;
use p384::pkcs8::EncodePrivateKey;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::LineEnding;
use rsa::traits::PublicKeyParts;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::AuthError;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while generating, loading or using keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Key generation failed.
    #[error("Key generation failed: {message}")]
    Generation {
        /// Description of the failure.
        message: String,
    },

    /// Stored or published key material is malformed.
    #[error("Invalid key: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },

    /// Signing failed.
    #[error("Signing failed: {message}")]
    Signing {
        /// Description of the failure.
        message: String,
    },
}

impl KeyError {
    /// Creates a key generation error.
    #[must_use]
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
        }
    }

    /// Creates an invalid key error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates a signing error.
    #[must_use]
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing {
            message: message.into(),
        }
    }
}

impl From<KeyError> for AuthError {
    fn from(err: KeyError) -> Self {
        AuthError::crypto(err.to_string())
    }
}

// ============================================================================
// Signing Algorithm
// ============================================================================

/// Supported asymmetric signing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// ECDSA with P-384 and SHA-384.
    ES384,
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RS256,
    /// RSASSA-PKCS1-v1_5 with SHA-384.
    RS384,
}

impl SigningAlgorithm {
    /// Converts to the jsonwebtoken algorithm.
    #[must_use]
    pub fn to_jwt_algorithm(self) -> Algorithm {
        match self {
            Self::ES384 => Algorithm::ES384,
            Self::RS256 => Algorithm::RS256,
            Self::RS384 => Algorithm::RS384,
        }
    }

    /// Returns the JOSE algorithm name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ES384 => "ES384",
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
        }
    }

    /// Returns true for RSA-based algorithms.
    #[must_use]
    pub fn is_rsa(&self) -> bool {
        matches!(self, Self::RS256 | Self::RS384)
    }
}

impl FromStr for SigningAlgorithm {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ES384" => Ok(Self::ES384),
            "RS256" => Ok(Self::RS256),
            "RS384" => Ok(Self::RS384),
            other => Err(KeyError::invalid_key(format!(
                "unsupported algorithm '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// JWKS Types
// ============================================================================

/// JSON Web Key Set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys in this set.
    pub keys: Vec<Jwk>,
}

/// Public JSON Web Key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA" or "EC").
    pub kty: String,

    /// Key ID.
    pub kid: String,

    /// Key use ("sig" for signing).
    #[serde(rename = "use")]
    pub use_: String,

    /// Algorithm.
    pub alg: String,

    // RSA-specific fields
    /// RSA modulus (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    // EC-specific fields
    /// EC curve name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC x coordinate (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    /// Parses the `alg` member.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidKey` for unsupported algorithms.
    pub fn algorithm(&self) -> Result<SigningAlgorithm, KeyError> {
        self.alg.parse()
    }

    /// Builds a verification key from the public components.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::InvalidKey` if a component is missing or malformed.
    pub fn to_decoding_key(&self) -> Result<DecodingKey, KeyError> {
        let missing = |name: &str| KeyError::invalid_key(format!("JWK {} missing '{name}'", self.kid));
        match self.kty.as_str() {
            "EC" => {
                let x = self.x.as_deref().ok_or_else(|| missing("x"))?;
                let y = self.y.as_deref().ok_or_else(|| missing("y"))?;
                DecodingKey::from_ec_components(x, y)
                    .map_err(|e| KeyError::invalid_key(e.to_string()))
            }
            "RSA" => {
                let n = self.n.as_deref().ok_or_else(|| missing("n"))?;
                let e = self.e.as_deref().ok_or_else(|| missing("e"))?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| KeyError::invalid_key(e.to_string()))
            }
            other => Err(KeyError::invalid_key(format!("unsupported kty '{other}'"))),
        }
    }
}

// ============================================================================
// Stored Form
// ============================================================================

/// A key pair as persisted in a signing-key block.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredSigningKey {
    /// Key ID.
    pub kid: String,
    /// PKCS#8 PEM private key.
    pub private_key: String,
    /// Public half.
    pub public: Jwk,
    /// Creation time.
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
}

impl fmt::Debug for StoredSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSigningKey")
            .field("kid", &self.kid)
            .field("alg", &self.public.alg)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Signing Key Pair
// ============================================================================

/// A loaded signing key pair.
pub struct SigningKeyPair {
    /// Key ID.
    pub kid: String,

    /// Signing algorithm.
    pub algorithm: SigningAlgorithm,

    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    private_pem: String,
    jwk: Jwk,

    /// When the key was created.
    pub created_at: OffsetDateTime,
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl SigningKeyPair {
    /// Generates a key pair for `algorithm`. CPU-bound, RSA especially.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate(algorithm: SigningAlgorithm) -> Result<Self, KeyError> {
        if algorithm.is_rsa() {
            Self::generate_rsa(algorithm)
        } else {
            Self::generate_ec()
        }
    }

    /// Generates a new 2048-bit RSA key pair.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails or algorithm is not RSA-based.
    pub fn generate_rsa(algorithm: SigningAlgorithm) -> Result<Self, KeyError> {
        if !algorithm.is_rsa() {
            return Err(KeyError::invalid_key(format!(
                "Algorithm {algorithm} is not RSA-based"
            )));
        }

        let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
            .map_err(|e| KeyError::generation(e.to_string()))?;
        let public_key = private_key.to_public_key();

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::generation(e.to_string()))?;

        let kid = uuid::Uuid::new_v4().to_string();
        let jwk = Jwk {
            kty: "RSA".to_string(),
            kid: kid.clone(),
            use_: "sig".to_string(),
            alg: algorithm.as_str().to_string(),
            n: Some(URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be())),
            e: Some(URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be())),
            crv: None,
            x: None,
            y: None,
        };

        Self::assemble(kid, algorithm, private_pem.to_string(), jwk, OffsetDateTime::now_utc())
    }

    /// Generates a new EC key pair using P-384 curve.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails.
    pub fn generate_ec() -> Result<Self, KeyError> {
        let secret_key = EcSecretKey::random(&mut OsRng);
        let signing_key = EcSigningKey::from(&secret_key);

        let point = signing_key.verifying_key().to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| KeyError::generation("Missing x coordinate"))?;
        let y = point
            .y()
            .ok_or_else(|| KeyError::generation("Missing y coordinate"))?;

        // Export to PKCS8 PEM (required by jsonwebtoken)
        let private_pem = secret_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::generation(e.to_string()))?;

        let kid = uuid::Uuid::new_v4().to_string();
        let jwk = Jwk {
            kty: "EC".to_string(),
            kid: kid.clone(),
            use_: "sig".to_string(),
            alg: SigningAlgorithm::ES384.as_str().to_string(),
            n: None,
            e: None,
            crv: Some("P-384".to_string()),
            x: Some(URL_SAFE_NO_PAD.encode(x.as_slice())),
            y: Some(URL_SAFE_NO_PAD.encode(y.as_slice())),
        };

        Self::assemble(
            kid,
            SigningAlgorithm::ES384,
            private_pem.to_string(),
            jwk,
            OffsetDateTime::now_utc(),
        )
    }

    /// Loads a key pair from its stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the private key or public JWK is malformed.
    pub fn from_stored(stored: &StoredSigningKey) -> Result<Self, KeyError> {
        if stored.kid != stored.public.kid {
            return Err(KeyError::invalid_key("kid does not match public key"));
        }
        let algorithm = stored.public.algorithm()?;
        Self::assemble(
            stored.kid.clone(),
            algorithm,
            stored.private_key.clone(),
            stored.public.clone(),
            stored.created_at,
        )
    }

    fn assemble(
        kid: String,
        algorithm: SigningAlgorithm,
        private_pem: String,
        jwk: Jwk,
        created_at: OffsetDateTime,
    ) -> Result<Self, KeyError> {
        let encoding_key = if algorithm.is_rsa() {
            EncodingKey::from_rsa_pem(private_pem.as_bytes())
        } else {
            EncodingKey::from_ec_pem(private_pem.as_bytes())
        }
        .map_err(|e| KeyError::invalid_key(e.to_string()))?;
        let decoding_key = jwk.to_decoding_key()?;

        Ok(Self {
            kid,
            algorithm,
            encoding_key,
            decoding_key,
            private_pem,
            jwk,
            created_at,
        })
    }

    /// Returns the stored form of this key pair.
    #[must_use]
    pub fn to_stored(&self) -> StoredSigningKey {
        StoredSigningKey {
            kid: self.kid.clone(),
            private_key: self.private_pem.clone(),
            public: self.jwk.clone(),
            created_at: self.created_at,
        }
    }

    /// Exports the public key as a JWK.
    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        self.jwk.clone()
    }

    /// Private key for signing.
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    /// Public key for verification.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Signs `message`, returning the base64url signature.
    ///
    /// # Errors
    ///
    /// Returns `KeyError::Signing` if the backend rejects the key.
    pub fn sign(&self, message: &[u8]) -> Result<String, KeyError> {
        jsonwebtoken::crypto::sign(message, &self.encoding_key, self.algorithm.to_jwt_algorithm())
            .map_err(|e| KeyError::signing(e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
