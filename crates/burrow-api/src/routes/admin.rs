// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::user::{UserChanges, UserRole, UserStore};
use crate::db::wireguard::WgStore;
use crate::error::ApiError;
use crate::extract::AdminUser;
use crate::routes::auth::UserResponse;
use crate::routes::wireguard::{live_stats, ServerResponse, UserTrafficStats};

async fn list_users(
    _admin: AdminUser,
    users: web::Data<UserStore>,
) -> Result<HttpResponse, ApiError> {
    let all = users.list().await?;
    let resp: Vec<_> = all.iter().map(UserResponse::from_user).collect();
    Ok(HttpResponse::Ok().json(resp))
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    name: Option<String>,
    email: Option<String>,
    password: Option<String>,
    role: Option<UserRole>,
}

async fn update_user(
    _admin: AdminUser,
    users: web::Data<UserStore>,
    path: web::Path<i64>,
    body: web::Json<UpdateUserRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let body = body.into_inner();

    if let Some(ref password) = body.password {
        if password.len() < 6 {
            return Err(ApiError::Validation(
                "password must be at least 6 characters".into(),
            ));
        }
    }

    let user = users
        .update(
            id,
            UserChanges {
                name: body.name,
                email: body.email,
                password: body.password,
                role: body.role,
            },
        )
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(HttpResponse::Ok().json(UserResponse::from_user(&user)))
}

/// Tear down a user's network and remove them. The rows go first (in one
/// transaction); a failed namespace teardown is logged and left to the
/// operator rather than resurrecting the user.
async fn delete_user(
    admin: AdminUser,
    users: web::Data<UserStore>,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();

    if id == admin.0.id {
        return Err(ApiError::Validation("cannot delete yourself".into()));
    }

    let target = users.get_by_id(id).await?.ok_or(ApiError::NotFound)?;
    if target.is_admin() {
        return Err(ApiError::Validation("cannot delete an admin".into()));
    }

    if let Some(server) = servers.server_for_user(target.id).await? {
        servers.delete_server_with_peers(server.id).await?;

        let provisioner = super::provisioner(&config);
        if let Err(e) = provisioner
            .destroy(&target.user_uid, server.wg_port as u16)
            .await
        {
            error!(
                user_uid = %target.user_uid,
                namespace = %server.namespace,
                error = %e,
                "network teardown failed, manual cleanup required"
            );
        }
    }

    users.delete(target.id).await?;
    info!(user_id = id, "deleted user");
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Serialize)]
struct AdminUserTraffic {
    server_id: i64,
    user_id: i64,
    user_uid: String,
    email: String,
    peer_count: usize,
    total_rx: i64,
    total_tx: i64,
    wg_port: i32,
    wg_address: String,
    namespace: String,
    enabled: bool,
    download_rate: i32,
    upload_rate: i32,
}

/// One row per provisioned server; servers whose interface cannot be read
/// are skipped rather than failing the whole listing.
async fn all_traffic(
    _admin: AdminUser,
    users: web::Data<UserStore>,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
) -> Result<HttpResponse, ApiError> {
    let all = servers.list_servers().await?;

    let mut rows = Vec::with_capacity(all.len());
    for server in &all {
        let stats = match live_stats(&servers, &config, server).await {
            Ok(stats) => stats,
            Err(_) => {
                warn!(namespace = %server.namespace, "skipping unreadable server");
                continue;
            }
        };
        let Some(user) = users.get_by_id(server.user_id).await? else {
            continue;
        };

        rows.push(AdminUserTraffic {
            server_id: server.id,
            user_id: server.user_id,
            user_uid: user.user_uid,
            email: user.email,
            peer_count: stats.peer_count,
            total_rx: stats.total_rx,
            total_tx: stats.total_tx,
            wg_port: server.wg_port,
            wg_address: server.wg_address.clone(),
            namespace: server.namespace.clone(),
            enabled: server.enabled,
            download_rate: server.download_rate,
            upload_rate: server.upload_rate,
        });
    }

    Ok(HttpResponse::Ok().json(rows))
}

async fn user_traffic(
    _admin: AdminUser,
    users: web::Data<UserStore>,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let user_id = path.into_inner();
    let user = users.get_by_id(user_id).await?.ok_or(ApiError::NotFound)?;
    let server = servers
        .server_for_user(user.id)
        .await?
        .ok_or(ApiError::NoServer)?;

    let stats = live_stats(&servers, &config, &server).await?;

    Ok(HttpResponse::Ok().json(UserTrafficStats {
        user_id: user.id,
        user_uid: user.user_uid,
        email: user.email,
        server_info: ServerResponse::from_row(&server),
        server_stats: stats,
    }))
}

async fn delete_server(
    _admin: AdminUser,
    users: web::Data<UserStore>,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let server = servers.get_server(id).await?.ok_or(ApiError::NotFound)?;
    let user = users.get_by_id(server.user_id).await?;

    servers.delete_server_with_peers(server.id).await?;

    match user {
        Some(user) => {
            let provisioner = super::provisioner(&config);
            if let Err(e) = provisioner
                .destroy(&user.user_uid, server.wg_port as u16)
                .await
            {
                error!(
                    namespace = %server.namespace,
                    error = %e,
                    "network teardown failed, manual cleanup required"
                );
            }
        }
        None => warn!(namespace = %server.namespace, "server without user, skipping teardown"),
    }

    info!(server_id = id, "deleted wireguard server");
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

async fn toggle_server(
    _admin: AdminUser,
    servers: web::Data<WgStore>,
    path: web::Path<i64>,
    body: web::Json<ToggleRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let server = servers
        .set_enabled(id, body.enabled)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(ServerResponse::from_row(&server)))
}

#[derive(Debug, Deserialize)]
struct RateLimitRequest {
    /// Mbps; 0 disables the limit. Persisted and reported only; shaping is
    /// not applied to the namespace.
    download_rate: i32,
    upload_rate: i32,
}

async fn set_rate_limit(
    _admin: AdminUser,
    servers: web::Data<WgStore>,
    path: web::Path<i64>,
    body: web::Json<RateLimitRequest>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    if body.download_rate < 0 || body.upload_rate < 0 {
        return Err(ApiError::Validation("rates must be non-negative".into()));
    }
    let server = servers
        .set_rate_limits(id, body.download_rate, body.upload_rate)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(ServerResponse::from_row(&server)))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/admin")
            .route("/users", web::get().to(list_users))
            .route("/users/{id}", web::patch().to(update_user))
            .route("/users/{id}", web::delete().to(delete_user))
            .route("/wireguard/traffic", web::get().to(all_traffic))
            .route("/wireguard/traffic/{id}", web::get().to(user_traffic))
            .route("/wireguard/servers/{id}", web::delete().to(delete_server))
            .route("/wireguard/servers/{id}/toggle", web::patch().to(toggle_server))
            .route("/wireguard/servers/{id}/ratelimit", web::patch().to(set_rate_limit)),
    );
}
