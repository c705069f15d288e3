//! Access token encoding and verification.
//!
//! Access tokens are standard compact JWS tokens with an IdentityClaims
//! payload and a `kid` header naming a key of the rotation pool. Oversized
//! tokens are compressed after signing.

use jsonwebtoken::{Header, Validation};
use time::OffsetDateTime;

use super::TokenRejection;
use super::claims::IdentityClaims;
use crate::codec;
use crate::keys::{SigningKeyPair, VerificationKeySet};
use crate::{AuthError, AuthResult};

/// When to compress signed access tokens.
#[derive(Debug, Clone, Copy)]
pub struct CompressionPolicy {
    /// Compression switch.
    pub enabled: bool,
    /// Signed length above which tokens are compressed.
    pub max_jwt_size: usize,
    /// Largest token validators will inflate.
    pub max_decompressed_size: usize,
}

/// Signs `claims` and compresses the result if the policy asks for it.
///
/// # Errors
///
/// Returns `AuthError::Crypto` if signing fails and
/// `AuthError::InvalidRequest` if the claims are too large to ever validate.
pub fn encode_access_token(
    key: &SigningKeyPair,
    claims: &IdentityClaims,
    policy: &CompressionPolicy,
) -> AuthResult<String> {
    let mut header = Header::new(key.algorithm.to_jwt_algorithm());
    header.kid = Some(key.kid.clone());

    let token = jsonwebtoken::encode(&header, claims, key.encoding_key())
        .map_err(|e| AuthError::crypto(format!("failed to sign access token: {e}")))?;

    if !policy.enabled || token.len() <= policy.max_jwt_size {
        return Ok(token);
    }
    if token.len() > policy.max_decompressed_size {
        return Err(AuthError::invalid_request(format!(
            "access token claims too large ({} bytes)",
            token.len()
        )));
    }
    codec::compress(&token).map_err(|e| AuthError::internal(format!("compression failed: {e}")))
}

/// Parameters for access token verification.
#[derive(Debug, Clone)]
pub struct AccessTokenRules<'a> {
    /// Expected issuer.
    pub issuer: &'a str,
    /// Allowed clock skew in seconds.
    pub leeway: i64,
    /// Decompression cap.
    pub max_decompressed_size: usize,
}

/// Verifies an access token's signature and claims.
///
/// Session liveness is checked by the caller.
///
/// # Errors
///
/// Returns the [`TokenRejection`] describing the first failed check.
pub fn decode_access_token(
    token: &str,
    keys: &VerificationKeySet,
    rules: &AccessTokenRules<'_>,
    now: OffsetDateTime,
) -> Result<IdentityClaims, TokenRejection> {
    let jwt = codec::decompress_if_marked(token, rules.max_decompressed_size)
        .map_err(|e| TokenRejection::Malformed(e.to_string()))?;

    let header = jsonwebtoken::decode_header(jwt.as_ref())
        .map_err(|e| TokenRejection::Malformed(e.to_string()))?;
    let kid = header
        .kid
        .ok_or_else(|| TokenRejection::Malformed("missing kid".to_string()))?;
    let key = keys
        .get(&kid)
        .ok_or_else(|| TokenRejection::UnknownKey(kid.clone()))?;

    let algorithm = key.algorithm.to_jwt_algorithm();
    if header.alg != algorithm {
        return Err(TokenRejection::Malformed(format!(
            "algorithm {:?} does not match key {kid}",
            header.alg
        )));
    }

    // Expiry is checked below against the injected clock.
    let mut validation = Validation::new(algorithm);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_issuer(&[rules.issuer]);
    validation.set_required_spec_claims(&["exp", "sub", "iss"]);

    let data = jsonwebtoken::decode::<IdentityClaims>(jwt.as_ref(), &key.decoding_key, &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenRejection::BadSignature,
            _ => TokenRejection::Claims(e.to_string()),
        })?;
    let claims = data.claims;

    if claims.sub.is_empty() {
        return Err(TokenRejection::Claims("empty sub".to_string()));
    }
    if claims.jti.as_deref().is_none_or(str::is_empty) {
        return Err(TokenRejection::Claims("missing jti".to_string()));
    }
    let exp = claims
        .exp
        .ok_or_else(|| TokenRejection::Claims("missing exp".to_string()))?;
    if exp + rules.leeway <= now.unix_timestamp() {
        return Err(TokenRejection::Expired);
    }

    Ok(claims)
}
