//! Claim sets carried by access tokens, sessions and refresh tokens.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Public claims. Becomes the access token payload.
///
/// The identity provider supplies `sub`, `aud` and any application fields;
/// the pipeline stamps `iss`, `jti`, `iat` and `exp`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Subject.
    #[serde(default)]
    pub sub: String,

    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,

    /// Token id, equal to the session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Expiration (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    /// Issued at (Unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    /// Application-defined fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdentityClaims {
    /// Creates claims for `subject` with no other fields set.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            sub: subject.into(),
            ..Self::default()
        }
    }

    /// Sets the audience.
    #[must_use]
    pub fn with_audience(mut self, aud: impl Into<String>) -> Self {
        self.aud = Some(aud.into());
        self
    }

    /// Adds an application-defined field.
    #[must_use]
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// Server-side claims bound to a session. Never leaves the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretClaims {
    /// Subject, if the provider wants it echoed back on refresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Caller-supplied lifetime cap in seconds, applied to both tokens.
    ///
    /// Can only shorten the configured lifetimes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Provider-defined fields (upstream credentials, tenant ids and so on).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SecretClaims {
    /// Caps token lifetimes to `seconds`.
    #[must_use]
    pub fn with_expires_in(mut self, seconds: u64) -> Self {
        self.expires_in = Some(seconds);
        self
    }

    /// Adds a provider-defined field.
    #[must_use]
    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// Refresh token payload: nothing but the session id and expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// Session id.
    pub jti: String,
    /// Expiration (Unix seconds).
    pub exp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_claims_flatten_extra() {
        let claims = IdentityClaims::new("user-1")
            .with_audience("orders")
            .with_claim("role", "admin");
        let json = serde_json::to_value(&claims).unwrap();

        assert_eq!(json["sub"], "user-1");
        assert_eq!(json["aud"], "orders");
        assert_eq!(json["role"], "admin");
        assert!(json.get("jti").is_none());

        let back: IdentityClaims = serde_json::from_value(json).unwrap();
        assert_eq!(back, claims);
    }

    #[test]
    fn test_secret_claims_override_field() {
        let secret = SecretClaims::default()
            .with_expires_in(60)
            .with_claim("upstream_token", "abc");
        let json = serde_json::to_string(&secret).unwrap();
        assert!(json.contains("\"expires_in\":60"));

        let back: SecretClaims = serde_json::from_str(&json).unwrap();
        assert_eq!(back.expires_in, Some(60));
        assert_eq!(back.extra["upstream_token"], "abc");
    }

    #[test]
    fn test_refresh_claims_are_minimal() {
        let claims = RefreshClaims {
            jti: "s1".to_string(),
            exp: 10,
        };
        assert_eq!(
            serde_json::to_string(&claims).unwrap(),
            r#"{"jti":"s1","exp":10}"#
        );
    }
}
