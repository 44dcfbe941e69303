//! JWT validation. Tokens are minted by the external identity service; the
//! issue path here exists for operational tooling and tests.

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

use super::models::{Claims, Role};

pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("invalid or expired token")?;

        debug!(sub = %decoded.claims.sub, "validated bearer token");
        Ok(decoded.claims)
    }

    pub fn issue(&self, sub: &str, role: Role) -> Result<String> {
        let exp = Utc::now()
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .context("invalid expiry timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: sub.to_string(),
            role,
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("failed to encode token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_validate_round_trip() {
        let handler = JwtHandler::new("test-secret-key-0123456789abcdef".to_string());
        let token = handler.issue("svc-distributor", Role::Trader).unwrap();

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "svc-distributor");
        assert_eq!(claims.role, Role::Trader);
        assert!(!claims.is_admin());
    }

    #[test]
    fn wrong_secret_rejected() {
        let issuer = JwtHandler::new("secret-one-0123456789abcdef0000".to_string());
        let verifier = JwtHandler::new("secret-two-0123456789abcdef0000".to_string());
        let token = issuer.issue("ops", Role::Admin).unwrap();
        assert!(verifier.validate_token(&token).is_err());
    }

    #[test]
    fn garbage_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-0123456789abcdef".to_string());
        assert!(handler.validate_token("not.a.token").is_err());
    }
}
