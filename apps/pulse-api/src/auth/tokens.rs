//! Bearer credential verification.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Identity decoded from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub sub: String,
    pub email: String,
    pub handle: String,
}

/// Claims carried by the JWTs issued by the authentication service.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub handle: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,
    #[error("Invalid or expired token")]
    Invalid,
}

/// Verifies bearer credentials. Supplied by the authentication collaborator;
/// its output is trusted as-is.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HS256 JWT verifier keyed by a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| {
                tracing::debug!(?e, "jwt validation failed");
                AuthError::Invalid
            },
        )?;
        let claims = data.claims;
        Ok(Identity {
            sub: claims.sub,
            email: claims.email,
            handle: claims.handle,
        })
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    fn mint(secret: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: "u1".to_string(),
            email: "u1@example.com".to_string(),
            handle: "alice".to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            iat: None,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn verifies_valid_token() {
        let verifier = JwtVerifier::new("s3cret");
        let identity = verifier.verify(&mint("s3cret", 300)).unwrap();
        assert_eq!(identity.sub, "u1");
        assert_eq!(identity.handle, "alice");
    }

    #[test]
    fn rejects_wrong_secret_and_expired() {
        let verifier = JwtVerifier::new("s3cret");
        assert_eq!(verifier.verify(&mint("other", 300)), Err(AuthError::Invalid));
        assert_eq!(verifier.verify(&mint("s3cret", -600)), Err(AuthError::Invalid));
        assert_eq!(verifier.verify("garbage"), Err(AuthError::Invalid));
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc "), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
