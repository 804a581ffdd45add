//! JWT credential generation and validation

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use parley_shared::{Identity, IdentityId, IdentityKind};

/// JWT claims carried by a connection credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (identity ID)
    pub sub: IdentityId,
    /// Display name at issue time
    pub name: String,
    /// Member or guest
    pub kind: IdentityKind,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// JWT manager for credential operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry: Duration,
}

impl JwtManager {
    /// Create a new JWT manager
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry: Duration::hours(expiry_hours),
        }
    }

    /// Issue a credential for an identity with the default lifetime
    pub fn issue(&self, identity: &Identity) -> Result<String, JwtError> {
        self.issue_until(identity, OffsetDateTime::now_utc() + self.expiry)
    }

    /// Issue a credential that expires at `expires_at`
    pub fn issue_until(
        &self,
        identity: &Identity,
        expires_at: OffsetDateTime,
    ) -> Result<String, JwtError> {
        let claims = Claims {
            sub: identity.id,
            name: identity.display_name.clone(),
            kind: identity.kind,
            iat: OffsetDateTime::now_utc().unix_timestamp(),
            exp: expires_at.unix_timestamp(),
        };

        // Explicit algorithm prevents algorithm confusion attacks
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Validate and decode a credential
    pub fn validate(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-at-least-32-chars!";

    #[test]
    fn test_token_generation_and_validation() {
        let jwt = JwtManager::new(SECRET, 24);
        let identity = Identity::guest(42, "Guest 42");

        let token = jwt.issue(&identity).expect("Failed to issue token");
        let claims = jwt.validate(&token).expect("Invalid token");

        assert_eq!(claims.sub, 42);
        assert_eq!(claims.kind, IdentityKind::Guest);
        assert_eq!(claims.name, "Guest 42");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new(SECRET, 24);
        let identity = Identity::member(1, "alice");

        // Past the 60 second leeway
        let expired_at = OffsetDateTime::now_utc() - Duration::minutes(5);
        let token = jwt.issue_until(&identity, expired_at).expect("Failed to issue token");

        assert!(matches!(jwt.validate(&token), Err(JwtError::Expired)));
    }

    #[test]
    fn test_foreign_signature_rejected() {
        let issuer = JwtManager::new("another-secret-that-is-long-enough!!", 24);
        let jwt = JwtManager::new(SECRET, 24);
        let token = issuer
            .issue(&Identity::member(1, "alice"))
            .expect("Failed to issue token");

        assert!(matches!(jwt.validate(&token), Err(JwtError::Invalid)));
        assert!(jwt.validate("not-a-jwt").is_err());
    }
}
