//! Bearer-token authentication
//!
//! Every resource is user-scoped. Requests carry `Authorization: Bearer
//! <jwt>`; the token's `sub` claim is the user id. The WebSocket route
//! reuses [`verify_token`] with the token passed as a query parameter.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::common::ApiError;
use crate::AppState;

#[derive(Clone)]
pub struct AuthConfig {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AuthConfig {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    admin: bool,
    #[allow(dead_code)]
    exp: usize,
}

/// The authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub admin: bool,
}

pub fn verify_token(config: &AuthConfig, token: &str) -> Result<AuthUser, ApiError> {
    let data = decode::<Claims>(token, &config.decoding_key, &config.validation)
        .map_err(|e| ApiError::auth(format!("invalid token: {e}")))?;

    let user_id = data
        .claims
        .sub
        .parse()
        .map_err(|_| ApiError::auth("token subject is not a user id"))?;

    Ok(AuthUser {
        user_id,
        admin: data.claims.admin,
    })
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::auth("missing Authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::auth("expected a bearer token"))?;

        verify_token(&state.auth, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> usize {
        (chrono::Utc::now().timestamp() + 3600) as usize
    }

    #[test]
    fn test_valid_token() {
        let config = AuthConfig::new("secret");
        let user_id = Uuid::now_v7();
        let token = token(
            "secret",
            json!({"sub": user_id.to_string(), "admin": true, "exp": future_exp()}),
        );

        let user = verify_token(&config, &token).unwrap();
        assert_eq!(user.user_id, user_id);
        assert!(user.admin);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let config = AuthConfig::new("right");
        let token = token(
            "wrong",
            json!({"sub": Uuid::now_v7().to_string(), "exp": future_exp()}),
        );
        assert!(verify_token(&config, &token).is_err());
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let config = AuthConfig::new("secret");
        let token = token("secret", json!({"sub": "not-a-uuid", "exp": future_exp()}));
        assert!(verify_token(&config, &token).is_err());
    }
}
