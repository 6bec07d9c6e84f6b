//! Provisioning tokens.
//!
//! A provisioning token is an HS256 JWT carrying only the runner name. It is
//! embedded in the VM's boot URL and exchanged once for a registration.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from minting or verifying a token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("invalid token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

/// Token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub name: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies provisioning tokens with one shared secret.
#[derive(Clone)]
pub struct ProvisioningTokens {
    secret: SecretString,
    ttl: Duration,
}

impl ProvisioningTokens {
    pub fn new(secret: SecretString, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    /// Mint a token for `name`, valid from now.
    pub fn mint(&self, name: &str) -> Result<String, TokenError> {
        self.mint_at(name, Utc::now().timestamp())
    }

    /// Mint a token as if issued at `now` (epoch seconds).
    pub fn mint_at(&self, name: &str, now: i64) -> Result<String, TokenError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            name: name.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
        };
        let key = EncodingKey::from_secret(self.secret.expose_secret().as_bytes());
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(TokenError::Sign)
    }

    /// Check signature, algorithm and expiry; return the runner name.
    pub fn verify(&self, token: &str) -> Result<String, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .map_err(TokenError::Invalid)?;
        Ok(data.claims.name)
    }
}

impl std::fmt::Debug for ProvisioningTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningTokens")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(secret: &str) -> ProvisioningTokens {
        ProvisioningTokens::new(SecretString::from(secret.to_string()), Duration::from_secs(300))
    }

    #[test]
    fn test_mint_and_verify() {
        let tokens = tokens("s3cret");
        let token = tokens.mint("gha-runner-100").unwrap();
        assert_eq!(tokens.verify(&token).unwrap(), "gha-runner-100");
    }

    #[test]
    fn test_rejects_other_secret() {
        let token = tokens("s3cret").mint("gha-runner-100").unwrap();
        assert!(matches!(tokens("other").verify(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_rejects_expired() {
        let tokens = tokens("s3cret");
        let issued = Utc::now().timestamp() - 301;
        let token = tokens.mint_at("gha-runner-100", issued).unwrap();
        assert!(matches!(tokens.verify(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn test_rejects_other_algorithm() {
        let claims = Claims {
            name: "gha-runner-100".to_string(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 300,
        };
        let key = EncodingKey::from_secret(b"s3cret");
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS512), &claims, &key).unwrap();
        assert!(tokens("s3cret").verify(&token).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(tokens("s3cret").verify("not.a.jwt").is_err());
        assert!(tokens("s3cret").verify("").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let debug = format!("{:?}", tokens("s3cret"));
        assert!(!debug.contains("s3cret"));
    }
}
