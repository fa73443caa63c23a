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

use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use burrow_net::catalog::PeerRecord;
use burrow_net::client_config::render_client_config;
use burrow_net::peers::{AddPeerRequest, UpdatePeerRequest};
use burrow_net::wireguard::{PeerStats, ServerStats};
use burrow_net::{SysWg, WgRuntime};

use crate::config::Config;
use crate::db::wireguard::{ServerRow, WgStore};
use crate::error::ApiError;
use crate::extract::AuthUser;
use crate::locks::ServerLocks;

#[derive(Debug, Serialize)]
pub struct ServerResponse {
    pub id: i64,
    pub user_id: i64,
    pub namespace: String,
    pub wg_interface: String,
    pub wg_port: i32,
    pub wg_public_key: String,
    pub wg_address: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl ServerResponse {
    pub fn from_row(s: &ServerRow) -> Self {
        Self {
            id: s.id,
            user_id: s.user_id,
            namespace: s.namespace.clone(),
            wg_interface: s.wg_interface.clone(),
            wg_port: s.wg_port,
            wg_public_key: s.wg_public_key.clone(),
            wg_address: s.wg_address.clone(),
            enabled: s.enabled,
            created_at: s.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct PeerResponse {
    id: i64,
    public_key: String,
    /// Held server-side so the UI can render a ready-to-import config.
    private_key: String,
    peer_address: String,
    allowed_ips: String,
    persistent_keepalive: u16,
    comment: String,
    enable_forwarding: bool,
    forward_interface: String,
    created_at: DateTime<Utc>,
}

impl PeerResponse {
    fn from_record(p: PeerRecord) -> Self {
        Self {
            id: p.id,
            public_key: p.public_key,
            private_key: p.private_key,
            peer_address: p.peer_address,
            allowed_ips: p.allowed_ips,
            persistent_keepalive: p.persistent_keepalive,
            comment: p.comment,
            enable_forwarding: p.enable_forwarding,
            forward_interface: p.forward_interface,
            created_at: p.created_at,
        }
    }
}

/// Read the live interface state and decorate each peer with its catalog
/// comment. Traffic-stats payloads never include private keys.
pub async fn live_stats(
    store: &WgStore,
    config: &Config,
    server: &ServerRow,
) -> Result<ServerStats, ApiError> {
    let wg = SysWg::new(config.network.config_dir.clone());
    let mut stats = wg
        .dump(&server.namespace, &server.wg_interface)
        .await
        .map_err(|e| {
            error!(namespace = %server.namespace, error = %e, "wg dump failed");
            ApiError::Internal
        })?;

    let rows = store.peers_for_server(server.id).await?;
    let comments: HashMap<&str, &str> = rows
        .iter()
        .filter(|p| !p.comment.is_empty())
        .map(|p| (p.public_key.as_str(), p.comment.as_str()))
        .collect();
    for peer in &mut stats.peers {
        if let Some(comment) = comments.get(peer.public_key.as_str()) {
            peer.comment = Some((*comment).to_string());
        }
    }

    Ok(stats)
}

async fn my_server(
    auth: AuthUser,
    servers: web::Data<WgStore>,
) -> Result<HttpResponse, ApiError> {
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;
    Ok(HttpResponse::Ok().json(ServerResponse::from_row(&server)))
}

#[derive(Debug, Serialize)]
struct TrafficSummary {
    peer_count: usize,
    total_rx: i64,
    total_tx: i64,
    peers: Vec<PeerTrafficSummary>,
}

#[derive(Debug, Serialize)]
struct PeerTrafficSummary {
    public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_handshake: Option<i64>,
    transfer_rx: i64,
    transfer_tx: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

impl PeerTrafficSummary {
    fn from_stats(p: &PeerStats) -> Self {
        Self {
            public_key: p.public_key.clone(),
            latest_handshake: p.latest_handshake,
            transfer_rx: p.transfer_rx,
            transfer_tx: p.transfer_tx,
            comment: p.comment.clone(),
        }
    }
}

/// Compact counters for dashboard polling.
async fn my_traffic(
    auth: AuthUser,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
) -> Result<HttpResponse, ApiError> {
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;
    let stats = live_stats(&servers, &config, &server).await?;

    Ok(HttpResponse::Ok().json(TrafficSummary {
        peer_count: stats.peer_count,
        total_rx: stats.total_rx,
        total_tx: stats.total_tx,
        peers: stats.peers.iter().map(PeerTrafficSummary::from_stats).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct UserTrafficStats {
    pub user_id: i64,
    pub user_uid: String,
    pub email: String,
    pub server_info: ServerResponse,
    pub server_stats: ServerStats,
}

async fn my_stats(
    auth: AuthUser,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
) -> Result<HttpResponse, ApiError> {
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;
    let stats = live_stats(&servers, &config, &server).await?;

    Ok(HttpResponse::Ok().json(UserTrafficStats {
        user_id: auth.0.id,
        user_uid: auth.0.user_uid.clone(),
        email: auth.0.email.clone(),
        server_info: ServerResponse::from_row(&server),
        server_stats: stats,
    }))
}

async fn list_peers(
    auth: AuthUser,
    servers: web::Data<WgStore>,
) -> Result<HttpResponse, ApiError> {
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;
    let peers = servers.peers_for_server(server.id).await?;
    let resp: Vec<_> = peers
        .iter()
        .map(|p| PeerResponse::from_record(p.to_record()))
        .collect();
    Ok(HttpResponse::Ok().json(resp))
}

#[derive(Debug, Deserialize)]
struct AddPeerBody {
    #[serde(default)]
    allowed_ips: String,
    persistent_keepalive: Option<u16>,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    enable_forwarding: bool,
    #[serde(default)]
    forward_interface: String,
}

async fn add_peer(
    auth: AuthUser,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    locks: web::Data<ServerLocks>,
    body: web::Json<AddPeerBody>,
) -> Result<HttpResponse, ApiError> {
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;
    let _guard = locks.acquire(server.id).await;

    let body = body.into_inner();
    let controller = super::peer_controller(&config, servers.get_ref().clone());
    let peer = controller
        .add_peer(
            auth.0.id,
            AddPeerRequest {
                allowed_ips: body.allowed_ips,
                persistent_keepalive: body.persistent_keepalive,
                comment: body.comment,
                enable_forwarding: body.enable_forwarding,
                forward_interface: body.forward_interface,
            },
        )
        .await?;

    Ok(HttpResponse::Created().json(PeerResponse::from_record(peer)))
}

#[derive(Debug, Deserialize)]
struct UpdatePeerBody {
    allowed_ips: Option<String>,
    persistent_keepalive: Option<u16>,
    comment: Option<String>,
    enable_forwarding: Option<bool>,
    forward_interface: Option<String>,
}

async fn update_peer(
    auth: AuthUser,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    locks: web::Data<ServerLocks>,
    path: web::Path<i64>,
    body: web::Json<UpdatePeerBody>,
) -> Result<HttpResponse, ApiError> {
    let peer_id = path.into_inner();
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;
    let _guard = locks.acquire(server.id).await;

    let body = body.into_inner();
    let controller = super::peer_controller(&config, servers.get_ref().clone());
    let peer = controller
        .update_peer(
            auth.0.id,
            peer_id,
            UpdatePeerRequest {
                allowed_ips: body.allowed_ips,
                persistent_keepalive: body.persistent_keepalive,
                comment: body.comment,
                enable_forwarding: body.enable_forwarding,
                forward_interface: body.forward_interface,
            },
        )
        .await?;

    Ok(HttpResponse::Ok().json(PeerResponse::from_record(peer)))
}

async fn delete_peer(
    auth: AuthUser,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    locks: web::Data<ServerLocks>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let peer_id = path.into_inner();
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;
    let _guard = locks.acquire(server.id).await;

    let controller = super::peer_controller(&config, servers.get_ref().clone());
    controller.remove_peer(auth.0.id, peer_id).await?;

    Ok(HttpResponse::NoContent().finish())
}

async fn peer_config(
    auth: AuthUser,
    servers: web::Data<WgStore>,
    config: web::Data<Config>,
    path: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    let peer_id = path.into_inner();
    let server = servers
        .server_for_user(auth.0.id)
        .await?
        .ok_or(ApiError::NoServer)?;

    let peer = servers
        .get_peer_row(peer_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if peer.server_id != server.id {
        return Err(ApiError::Forbidden);
    }

    let text = render_client_config(
        &peer.to_record(),
        &server.to_record(),
        &config.network.server_ip,
    );
    Ok(HttpResponse::Ok().json(serde_json::json!({ "config": text })))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/wireguard")
            .route("/server", web::get().to(my_server))
            .route("/traffic", web::get().to(my_traffic))
            .route("/stats", web::get().to(my_stats))
            .route("/peers", web::get().to(list_peers))
            .route("/peers", web::post().to(add_peer))
            .route("/peers/{id}", web::patch().to(update_peer))
            .route("/peers/{id}", web::delete().to(delete_peer))
            .route("/peers/{id}/config", web::get().to(peer_config)),
    );
}
