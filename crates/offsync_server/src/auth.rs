//! Authentication support for the sync server.
//!
//! This module provides bearer tokens signed with HMAC-SHA256.
//! Tokens include a timestamp for expiration checking.
//!
//! ## Token Format
//!
//! `{subject}.{issued_at}.{signature}` where `issued_at` is Unix millis and
//! `signature` is the lowercase hex HMAC of `{subject}.{issued_at}`.
//! The subject may itself contain dots.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Token validator for incoming requests.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `subject`.
    pub fn create_token(&self, subject: &str) -> ServerResult<String> {
        self.create_token_at(subject, now_millis())
    }

    fn create_token_at(&self, subject: &str, issued_at: u64) -> ServerResult<String> {
        let payload = format!("{subject}.{issued_at}");
        let signature = self.mac(payload.as_bytes())?.finalize().into_bytes();
        Ok(format!("{payload}.{}", hex::encode(signature)))
    }

    /// Validates a token and returns its subject.
    pub fn validate_token(&self, token: &str) -> ServerResult<String> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| ServerError::NotAuthorized("malformed token".into()))?;
        let (subject, issued_at) = payload
            .rsplit_once('.')
            .ok_or_else(|| ServerError::NotAuthorized("malformed token".into()))?;
        let issued_at: u64 = issued_at
            .parse()
            .map_err(|_| ServerError::NotAuthorized("malformed token".into()))?;
        let signature = hex::decode(signature)
            .map_err(|_| ServerError::NotAuthorized("malformed signature".into()))?;

        self.mac(payload.as_bytes())?
            .verify_slice(&signature)
            .map_err(|_| ServerError::NotAuthorized("invalid signature".into()))?;

        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > issued_at.saturating_add(expiry_millis) {
            return Err(ServerError::NotAuthorized("token expired".into()));
        }

        Ok(subject.to_string())
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

/// Simple token validator that compares against a shared secret.
/// Useful for testing.
#[derive(Clone)]
pub struct SimpleTokenValidator {
    secret: String,
}

impl SimpleTokenValidator {
    /// Creates a validator with a simple shared secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Accepts only the shared secret itself.
    pub fn validate(&self, token: &str) -> ServerResult<()> {
        if token == self.secret {
            Ok(())
        } else {
            Err(ServerError::NotAuthorized("invalid token".into()))
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token("device-1").unwrap();
        assert!(token.starts_with("device-1."));
        assert_eq!(validator.validate_token(&token).unwrap(), "device-1");
    }

    #[test]
    fn subject_may_contain_dots() {
        let validator = validator();
        let token = validator.create_token("user@example.com").unwrap();
        assert_eq!(validator.validate_token(&token).unwrap(), "user@example.com");
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token("device-1").unwrap();

        let forged = token.replacen("device-1", "device-2", 1);
        assert!(validator.validate_token(&forged).is_err());

        let mut flipped = token.clone();
        let last = if flipped.ends_with('0') { '1' } else { '0' };
        flipped.pop();
        flipped.push(last);
        assert!(validator.validate_token(&flipped).is_err());
    }

    #[test]
    fn reject_other_secret() {
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        let token = other.create_token("device-1").unwrap();
        assert!(validator().validate_token(&token).is_err());
    }

    #[test]
    fn reject_malformed_token() {
        let validator = validator();
        assert!(validator.validate_token("").is_err());
        assert!(validator.validate_token("no-dots").is_err());
        assert!(validator.validate_token("a.notanumber.00").is_err());
        assert!(validator.validate_token("a.1.zz").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"secret".to_vec()).with_expiry(Duration::from_secs(60)),
        );
        let stale = validator
            .create_token_at("device-1", now_millis() - 61_000)
            .unwrap();
        let err = validator.validate_token(&stale).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn signature_is_lowercase_hex_sha256() {
        let validator = validator();
        let token = validator.create_token("device-1").unwrap();
        let (_, signature) = token.rsplit_once('.').unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(hex::decode(signature).unwrap().len(), 32);
        assert!(signature.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));

        let odd = format!("{}.{}", token.rsplit_once('.').unwrap().0, &signature[1..]);
        let err = validator.validate_token(&odd).unwrap_err();
        assert!(err.to_string().contains("malformed signature"));
    }

    #[test]
    fn simple_validator() {
        let validator = SimpleTokenValidator::new("shared-secret");

        assert!(validator.validate("shared-secret").is_ok());
        assert!(validator.validate("wrong-secret").is_err());
    }
}
