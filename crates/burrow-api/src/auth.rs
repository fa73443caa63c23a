use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::db::user::UserRole;
use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: UserRole,
    pub exp: i64,
    pub iat: i64,
}

#[tracing::instrument(skip(secret))]
pub fn create_token(
    user_id: i64,
    role: UserRole,
    secret: &str,
    expire_hours: i64,
) -> Result<String, ApiError> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        role,
        exp: now + expire_hours * 3600,
        iat: now,
    };

    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(error = %e, "failed to create JWT");
        ApiError::Internal
    })
}

#[tracing::instrument(skip(token, secret))]
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_valid_token() {
        let token = create_token(7, UserRole::Admin, "secret", 24).unwrap();
        let claims = validate_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.role, UserRole::Admin);
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = create_token(7, UserRole::NormalUser, "secret", 24).unwrap();
        assert!(validate_token(&token, "other-secret").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(validate_token("not-a-jwt", "secret").is_err());
    }
}
