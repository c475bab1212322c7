//! Delegated authentication.
//!
//! The storefront does not issue credentials. Bearer tokens come from the
//! identity provider and are only validated here to resolve the caller.

use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Claims issued by the identity provider
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // User ID
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Authenticated caller resolved from a bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingAuth,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
}

impl From<AuthError> for ServiceError {
    fn from(_: AuthError) -> Self {
        ServiceError::Unauthorized
    }
}

/// Resolves the current user from a bearer token.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, bearer_token: &str) -> Result<AuthUser, AuthError>;
}

/// HS256 validation against the identity provider's shared secret.
#[derive(Clone)]
pub struct JwtIdentityProvider {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str, issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self::new(
            &config.jwt_secret,
            config.jwt_issuer.as_deref(),
            config.jwt_audience.as_deref(),
        )
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn resolve(&self, bearer_token: &str) -> Result<AuthUser, AuthError> {
        let claims = self.validate_token(bearer_token)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;

        Ok(AuthUser {
            user_id,
            email: claims.email,
            role: claims.role,
        })
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, AuthError> {
    let value = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingAuth)?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingAuth)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<dyn IdentityProvider>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let provider = Arc::<dyn IdentityProvider>::from_ref(state);
        let token = bearer_token(parts)?;

        provider.resolve(token).await.map_err(|err| {
            debug!(error = %err, "rejecting bearer token");
            ServiceError::from(err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "identity_provider_secret_for_unit_tests_0123456789";

    fn token(sub: &str, exp_offset: i64, aud: Option<&str>) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            email: Some("buyer@example.com".into()),
            role: Some("authenticated".into()),
            exp: now + exp_offset,
            iat: Some(now),
            iss: None,
            aud: aud.map(str::to_string),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn resolves_user_from_valid_token() {
        let provider = JwtIdentityProvider::new(SECRET, None, None);
        let user_id = Uuid::new_v4();
        let user = provider
            .resolve(&token(&user_id.to_string(), 3600, None))
            .await
            .unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email.as_deref(), Some("buyer@example.com"));
    }

    #[tokio::test]
    async fn rejects_expired_and_foreign_tokens() {
        let provider = JwtIdentityProvider::new(SECRET, None, None);
        let sub = Uuid::new_v4().to_string();

        assert_matches!(
            provider.resolve(&token(&sub, -3600, None)).await,
            Err(AuthError::TokenExpired)
        );

        let other = JwtIdentityProvider::new("a_completely_different_secret_value_42", None, None);
        assert_matches!(
            other.resolve(&token(&sub, 3600, None)).await,
            Err(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn rejects_non_uuid_subject_and_wrong_audience() {
        let provider = JwtIdentityProvider::new(SECRET, None, Some("authenticated"));
        assert!(provider
            .resolve(&token("not-a-uuid", 3600, Some("authenticated")))
            .await
            .is_err());
        assert!(provider
            .resolve(&token(&Uuid::new_v4().to_string(), 3600, Some("anon")))
            .await
            .is_err());
    }
}
