use actix_web::dev::Payload;
use actix_web::web::Data;
use actix_web::{FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;

use crate::auth::validate_token;
use crate::config::Config;
use crate::db::user::{User, UserStore};
use crate::error::ApiError;

/// The authenticated user behind a `Authorization: Bearer <jwt>` header,
/// loaded fresh from the store so role changes apply immediately.
#[derive(Debug)]
pub struct AuthUser(pub User);

fn bearer_token(req: &HttpRequest) -> Result<String, ApiError> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
        .ok_or(ApiError::Unauthorized)
}

async fn load_user(
    store: Option<Data<UserStore>>,
    config: Option<Data<Config>>,
    token: Result<String, ApiError>,
) -> Result<User, ApiError> {
    let store = store.ok_or(ApiError::Internal)?;
    let config = config.ok_or(ApiError::Internal)?;
    let claims = validate_token(&token?, &config.jwt_secret)?;

    store
        .get_by_id(claims.sub)
        .await?
        .ok_or(ApiError::Unauthorized)
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let store = req.app_data::<Data<UserStore>>().cloned();
        let config = req.app_data::<Data<Config>>().cloned();
        let token = bearer_token(req);

        Box::pin(async move { load_user(store, config, token).await.map(AuthUser) })
    }
}

/// Like [`AuthUser`] but refuses non-admin callers.
#[derive(Debug)]
pub struct AdminUser(pub User);

impl FromRequest for AdminUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let store = req.app_data::<Data<UserStore>>().cloned();
        let config = req.app_data::<Data<Config>>().cloned();
        let token = bearer_token(req);

        Box::pin(async move {
            let user = load_user(store, config, token).await?;
            if !user.is_admin() {
                return Err(ApiError::Forbidden);
            }
            Ok(AdminUser(user))
        })
    }
}
