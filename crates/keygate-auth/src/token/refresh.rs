//! Refresh token format and session resolution.
//!
//! A refresh token is `{kid}.{payload}.{signature}`: the JOSE header is
//! replaced by the bare key id, and the payload carries only the session id
//! and expiry. The signature covers `{kid}.{payload}` and is verified with
//! the public key pinned in the session, never by searching the pool.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use super::TokenRejection;
use super::claims::RefreshClaims;
use crate::AuthResult;
use crate::keys::{Jwk, SigningKeyPair};
use crate::storage::{Session, SessionStore};

/// Refresh tokens longer than this are rejected before parsing.
const MAX_REFRESH_TOKEN_LEN: usize = 2048;

/// Short SHA-256 fingerprint of a token for log correlation.
///
/// Tokens themselves are never logged.
#[must_use]
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// Signs a refresh token.
///
/// # Errors
///
/// Returns an error if serialization or signing fails.
pub fn encode_refresh_token(key: &SigningKeyPair, claims: &RefreshClaims) -> AuthResult<String> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{}.{payload}", key.kid);
    let signature = key.sign(signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{signature}"))
}

/// A parsed, not yet verified refresh token.
#[derive(Debug)]
pub struct UnverifiedRefreshToken<'a> {
    /// Key id from the first segment.
    pub kid: &'a str,
    /// Decoded payload.
    pub claims: RefreshClaims,
    signing_input: &'a str,
    signature: &'a str,
}

impl<'a> UnverifiedRefreshToken<'a> {
    /// Splits and decodes a refresh token without checking its signature.
    ///
    /// # Errors
    ///
    /// Returns `TokenRejection::Malformed` for anything but three non-empty
    /// segments with a JSON payload.
    pub fn parse(token: &'a str) -> Result<Self, TokenRejection> {
        if token.len() > MAX_REFRESH_TOKEN_LEN {
            return Err(TokenRejection::Malformed("refresh token too long".to_string()));
        }
        let malformed = || TokenRejection::Malformed("expected kid.payload.signature".to_string());

        let (signing_input, signature) = token.rsplit_once('.').ok_or_else(malformed)?;
        let (kid, payload) = signing_input.split_once('.').ok_or_else(malformed)?;
        if kid.is_empty() || payload.is_empty() || signature.is_empty() {
            return Err(malformed());
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| TokenRejection::Malformed(e.to_string()))?;
        let claims: RefreshClaims =
            serde_json::from_slice(&bytes).map_err(|e| TokenRejection::Malformed(e.to_string()))?;
        if claims.jti.is_empty() {
            return Err(TokenRejection::Claims("empty jti".to_string()));
        }

        Ok(Self {
            kid,
            claims,
            signing_input,
            signature,
        })
    }

    /// Verifies the signature against a pinned public key.
    ///
    /// # Errors
    ///
    /// Returns `TokenRejection::UnknownKey` if `jwk` is not the key named by
    /// the token, and `TokenRejection::BadSignature` if verification fails.
    pub fn verify(&self, jwk: &Jwk) -> Result<(), TokenRejection> {
        if jwk.kid != self.kid {
            return Err(TokenRejection::UnknownKey(self.kid.to_string()));
        }
        let algorithm = jwk
            .algorithm()
            .map_err(|e| TokenRejection::Malformed(e.to_string()))?;
        let key = jwk
            .to_decoding_key()
            .map_err(|e| TokenRejection::Malformed(e.to_string()))?;

        match jsonwebtoken::crypto::verify(
            self.signature,
            self.signing_input.as_bytes(),
            &key,
            algorithm.to_jwt_algorithm(),
        ) {
            Ok(true) => Ok(()),
            _ => Err(TokenRejection::BadSignature),
        }
    }
}

/// Resolves the session a refresh token belongs to.
///
/// The outer `Result` carries store failures; the inner one the reason a
/// token was refused. With `leeway` set to `None` expiry is not checked,
/// which revocation uses to tear down sessions of expired tokens.
///
/// # Errors
///
/// Returns a system error if the session store fails.
pub async fn resolve_session(
    sessions: &dyn SessionStore,
    token: &str,
    now: OffsetDateTime,
    leeway: Option<i64>,
) -> AuthResult<Result<Session, TokenRejection>> {
    let parsed = match UnverifiedRefreshToken::parse(token) {
        Ok(parsed) => parsed,
        Err(rejection) => return Ok(Err(rejection)),
    };

    let Some(session) = sessions.get(&parsed.claims.jti).await? else {
        return Ok(Err(TokenRejection::NoSession));
    };

    if let Err(rejection) = parsed.verify(&session.refresh_key) {
        return Ok(Err(rejection));
    }

    if let Some(leeway) = leeway {
        if parsed.claims.exp + leeway <= now.unix_timestamp() {
            return Ok(Err(TokenRejection::Expired));
        }
    }

    Ok(Ok(session))
}
