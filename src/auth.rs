use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{GatewayError, Result};

pub const ADMIN_ROLE: &str = "admin";

/// JWT claims carried by issued bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub roles: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Issues and validates bearer tokens and verifies admin credentials.
///
/// The admin password is hashed with Argon2 at construction so the plaintext
/// never outlives startup.
pub struct AuthService {
    pub enabled: bool,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    token_duration: chrono::Duration,
    admin_username: String,
    admin_password_hash: String,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let salt = SaltString::generate(&mut OsRng);
        let admin_password_hash = Argon2::default()
            .hash_password(config.admin_password.as_bytes(), &salt)
            .map_err(|e| GatewayError::Internal(format!("Failed to hash admin password: {}", e)))?
            .to_string();

        let mut validation = Validation::default();
        validation.leeway = 0;

        Ok(Self {
            enabled: config.enabled,
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            token_duration: chrono::Duration::from_std(config.token_duration)
                .map_err(|e| GatewayError::Internal(format!("Invalid token duration: {}", e)))?,
            admin_username: config.admin_username.clone(),
            admin_password_hash,
        })
    }

    pub fn verify_credentials(&self, username: &str, password: &str) -> bool {
        if username != self.admin_username {
            return false;
        }
        let Ok(parsed) = PasswordHash::new(&self.admin_password_hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    pub fn generate_token(&self, user_id: &str, username: &str, roles: Vec<String>) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            roles,
            exp: (now + self.token_duration).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(format!("Failed to sign token: {}", e)))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::Unauthorized(e.to_string()))
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some("Bearer"), Some(token)) if !token.is_empty() => Some(token),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn service() -> AuthService {
        AuthService::new(&AuthConfig {
            enabled: true,
            jwt_secret: "test-secret".into(),
            token_duration: Duration::from_secs(3600),
            admin_username: "admin".into(),
            admin_password: "password".into(),
        })
        .unwrap()
    }

    #[test]
    fn token_round_trip() {
        let auth = service();
        let token = auth
            .generate_token("1", "admin", vec![ADMIN_ROLE.to_string()])
            .unwrap();

        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "1");
        assert_eq!(claims.username, "admin");
        assert!(claims.has_role(ADMIN_ROLE));
        assert!(!claims.has_role("viewer"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = service();
        let now = Utc::now();
        let claims = Claims {
            sub: "1".into(),
            username: "admin".into(),
            roles: vec![ADMIN_ROLE.to_string()],
            exp: (now - chrono::Duration::seconds(1000)).timestamp(),
            iat: (now - chrono::Duration::seconds(2000)).timestamp(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        assert!(matches!(
            auth.validate_token(&token),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let auth = service();
        let other = AuthService::new(&AuthConfig {
            enabled: true,
            jwt_secret: "other-secret".into(),
            token_duration: Duration::from_secs(3600),
            admin_username: "admin".into(),
            admin_password: "password".into(),
        })
        .unwrap();

        let token = other.generate_token("1", "admin", vec![]).unwrap();
        assert!(auth.validate_token(&token).is_err());
    }

    #[test]
    fn credential_verification() {
        let auth = service();
        assert!(auth.verify_credentials("admin", "password"));
        assert!(!auth.verify_credentials("admin", "wrong"));
        assert!(!auth.verify_credentials("root", "password"));
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
