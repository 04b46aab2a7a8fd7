//! Bearer token handling

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::errors::{Error, Result};

/// Claims carried by an AirCloud access or refresh token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Subject (user identity)
    pub sub: String,

    /// Issuer
    pub iss: String,

    /// Audience
    pub aud: String,

    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Issued at timestamp
    pub iat: i64,

    /// Expiration timestamp
    pub exp: i64,
}

/// A bearer token plus its decoded claims.
#[derive(Debug, Clone)]
pub struct BearerToken {
    /// Raw token string as sent on the wire
    pub raw: String,

    /// Decoded claims
    pub claims: TokenClaims,
}

impl BearerToken {
    /// Decode a raw JWT. The signature is not verified: the client only
    /// needs the claims, the backend is the one enforcing validity.
    pub fn from_raw(raw: String) -> Result<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;

        let token_data = decode::<TokenClaims>(&raw, &DecodingKey::from_secret(b""), &validation)
            .map_err(|e| Error::Token(format!("failed to decode token: {}", e)))?;

        Ok(Self {
            raw,
            claims: token_data.claims,
        })
    }

    /// Get expiration time
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.claims.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// True while the token stays valid for at least `margin` more.
    pub fn is_valid_for(&self, margin: Duration) -> bool {
        Utc::now() + margin <= self.expires_at()
    }
}

/// Access/refresh token pair returned by sign-in and refresh exchanges.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: BearerToken,
    pub refresh: BearerToken,
}

impl TokenPair {
    pub fn from_raw(access: String, refresh: String) -> Result<Self> {
        Ok(Self {
            access: BearerToken::from_raw(access)?,
            refresh: BearerToken::from_raw(refresh)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn make_token(exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = json!({
            "sub": "user@example.com",
            "iss": "https://iam.example.com",
            "aud": "aircloud",
            "scopes": ["rac.read", "rac.control"],
            "iat": now,
            "exp": now + exp_offset_secs,
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test")).unwrap()
    }

    #[test]
    fn test_decode_claims() {
        let token = BearerToken::from_raw(make_token(3600)).unwrap();
        assert_eq!(token.claims.sub, "user@example.com");
        assert_eq!(token.claims.scopes, vec!["rac.read", "rac.control"]);
        assert!(token.expires_at() > Utc::now());
    }

    #[test]
    fn test_validity_margin() {
        let token = BearerToken::from_raw(make_token(30)).unwrap();
        assert!(token.is_valid_for(Duration::seconds(0)));
        assert!(!token.is_valid_for(Duration::minutes(1)));
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(BearerToken::from_raw("not-a-jwt".to_string()).is_err());
    }
}
