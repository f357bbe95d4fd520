//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs issued elsewhere; the `sub` claim is the user id.
//! Handlers take [`AuthUser`] as an extractor and compare it against the
//! owner of the resource they touch.

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header::AUTHORIZATION, request::Parts};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &Secret<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(
                secret.expose_secret().as_bytes(),
            )),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
}

impl AuthUser {
    /// Forbidden unless the caller is `owner`.
    pub fn ensure_owner(&self, owner: Uuid) -> Result<(), AppError> {
        if self.user_id != owner {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Resource belongs to another user"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    JwtVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing bearer token")))?;

        let claims = JwtVerifier::from_ref(state).verify(token)?;

        tracing::Span::current().record("user_id", tracing::field::display(claims.sub));

        Ok(AuthUser {
            user_id: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: Uuid, exp: i64) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims { sub, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(&Secret::new("test-secret".to_string()))
    }

    #[test]
    fn accepts_tokens_signed_with_the_shared_secret() {
        let user_id = Uuid::new_v4();
        let exp = chrono::Utc::now().timestamp() + 600;
        let claims = verifier().verify(&token("test-secret", user_id, exp)).unwrap();
        assert_eq!(claims.sub, user_id);
    }

    #[test]
    fn rejects_foreign_and_expired_tokens() {
        let exp = chrono::Utc::now().timestamp() + 600;
        assert!(verifier()
            .verify(&token("other-secret", Uuid::new_v4(), exp))
            .is_err());

        let expired = chrono::Utc::now().timestamp() - 3600;
        assert!(verifier()
            .verify(&token("test-secret", Uuid::new_v4(), expired))
            .is_err());
    }

    #[test]
    fn ownership_check() {
        let me = AuthUser {
            user_id: Uuid::new_v4(),
        };
        assert!(me.ensure_owner(me.user_id).is_ok());
        assert!(matches!(
            me.ensure_owner(Uuid::new_v4()),
            Err(AppError::Forbidden(_))
        ));
    }
}
