use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use streamgate_core::{AuthError, IdentityVerifier, UserId};

/// Extract the bearer credential from an upgrade request.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Verifier for demo serving: the bearer token is taken verbatim as the
/// user id. A production deployment substitutes its own implementation
/// behind the same trait.
pub struct TrustedTokenVerifier;

#[async_trait]
impl IdentityVerifier for TrustedTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        let token = credential.trim();
        if token.is_empty() {
            return Err(AuthError::Malformed);
        }
        Ok(UserId::from(token))
    }
}
