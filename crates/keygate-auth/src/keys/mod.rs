//! Signing keys and their rotation.

pub mod block;
pub mod manager;
pub mod populator;
pub mod signing_key;

pub use block::{block_key, block_start};
pub use manager::{KeyRotationManager, RotationSettings, VerificationKey, VerificationKeySet};
pub use populator::{PopulatorHandle, populator_running};
pub use signing_key::{Jwk, Jwks, KeyError, SigningAlgorithm, SigningKeyPair, StoredSigningKey};
