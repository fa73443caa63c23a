use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use burrow_net::provision::derive;

use crate::config::Config;
use crate::db::user::{User, UserChanges, UserRole, UserStore};
use crate::db::wireguard::WgStore;
use crate::error::ApiError;
use crate::extract::AuthUser;

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    name: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub user_uid: String,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl UserResponse {
    pub fn from_user(u: &User) -> Self {
        Self {
            id: u.id,
            user_uid: u.user_uid.clone(),
            email: u.email.clone(),
            name: u.name.clone(),
            role: u.role,
            created_at: u.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    user: UserResponse,
}

fn validate_registration(req: &RegisterRequest) -> Result<(), ApiError> {
    if !req.email.contains('@') {
        return Err(ApiError::Validation("invalid email".into()));
    }
    if req.password.len() < 6 {
        return Err(ApiError::Validation(
            "password must be at least 6 characters".into(),
        ));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty".into()));
    }
    Ok(())
}

/// Register a new user and stand up their network environment. The network
/// and the rows commit together: a failure at any point unwinds both.
async fn register(
    users: web::Data<UserStore>,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    body: web::Json<RegisterRequest>,
) -> Result<HttpResponse, ApiError> {
    validate_registration(&body)?;

    let user = users
        .create(&body.email, body.name.trim(), &body.password, UserRole::NormalUser)
        .await?;

    // A hash collision on the derived namespace/port with an existing user
    // makes this uid unusable on this host.
    let net = derive(&user.user_uid, &config.network);
    if servers
        .derived_params_taken(&net.ns_name, net.wg_port)
        .await?
    {
        warn!(user_uid = %user.user_uid, "derived parameters collide, rejecting registration");
        if let Err(e) = users.delete(user.id).await {
            error!(error = %e, "failed to remove user after collision");
        }
        return Err(ApiError::DerivedParamsTaken);
    }

    let provisioner = super::provisioner(&config);
    let provisioned = match provisioner.provision(&user.user_uid).await {
        Ok(provisioned) => provisioned,
        Err(e) => {
            error!(user_uid = %user.user_uid, error = %e, "network provisioning failed");
            if let Err(e) = users.delete(user.id).await {
                error!(error = %e, "failed to remove user after provisioning failure");
            }
            return Err(e.into());
        }
    };

    if let Err(e) = servers.create_server(user.id, &provisioned).await {
        error!(user_uid = %user.user_uid, error = %e, "failed to persist server, destroying network");
        if let Err(destroy_err) = provisioner.destroy(&user.user_uid, provisioned.wg_port).await {
            error!(error = %destroy_err, "network teardown after persist failure also failed");
        }
        if let Err(e) = users.delete(user.id).await {
            error!(error = %e, "failed to remove user after persist failure");
        }
        return Err(e.into());
    }

    info!(user_id = user.id, user_uid = %user.user_uid, "registered user with network");
    Ok(HttpResponse::Created().json(UserResponse::from_user(&user)))
}

async fn login(
    users: web::Data<UserStore>,
    config: web::Data<Config>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = users
        .get_by_email(&body.email)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    if !users.verify_password(&user, &body.password)? {
        return Err(ApiError::InvalidCredentials);
    }

    let token = crate::auth::create_token(
        user.id,
        user.role,
        &config.jwt_secret,
        config.jwt_expire_hours,
    )?;

    Ok(HttpResponse::Ok().json(LoginResponse {
        token,
        user: UserResponse::from_user(&user),
    }))
}

async fn me(auth: AuthUser) -> HttpResponse {
    HttpResponse::Ok().json(UserResponse::from_user(&auth.0))
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRequest {
    name: Option<String>,
    password: Option<String>,
}

async fn update_profile(
    auth: AuthUser,
    users: web::Data<UserStore>,
    body: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();

    if let Some(ref password) = body.password {
        if password.len() < 6 {
            return Err(ApiError::Validation(
                "password must be at least 6 characters".into(),
            ));
        }
    }
    if body.name.is_none() && body.password.is_none() {
        return Err(ApiError::Validation("no fields to update".into()));
    }

    let changes = UserChanges {
        name: body.name,
        password: body.password,
        ..Default::default()
    };
    let user = users
        .update(auth.0.id, changes)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(HttpResponse::Ok().json(UserResponse::from_user(&user)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    // No scope here: a bare "/api" scope would also capture the wireguard
    // and admin prefixes registered after it.
    cfg.route("/api/register", web::post().to(register))
        .route("/api/login", web::post().to(login))
        .route("/api/me", web::get().to(me))
        .route("/api/me", web::patch().to(update_profile));
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("a@b.c", "secret1", "alice", true ; "valid")]
    #[test_case("not-an-email", "secret1", "alice", false ; "bad email")]
    #[test_case("a@b.c", "short", "alice", false ; "short password")]
    #[test_case("a@b.c", "secret1", "  ", false ; "blank name")]
    fn registration_validation(email: &str, password: &str, name: &str, ok: bool) {
        let req = RegisterRequest {
            email: email.into(),
            name: name.into(),
            password: password.into(),
        };
        assert_eq!(validate_registration(&req).is_ok(), ok);
    }
}
