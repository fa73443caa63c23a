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

//! Persistence contract for servers and peers. The core never talks to a
//! database; the API crate implements these traits over its store.

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Opaque error from the persistence layer.
#[derive(Debug, Error)]
#[error("catalog error: {0}")]
pub struct CatalogError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

impl CatalogError {
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

/// A user's provisioned WireGuard server, one per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: i64,
    pub user_id: i64,
    pub namespace: String,
    pub wg_interface: String,
    pub wg_port: u16,
    pub wg_public_key: String,
    pub wg_private_key: String,
    /// CIDR form, e.g. `10.100.5.1/24`.
    pub wg_address: String,
    pub enabled: bool,
    pub download_rate: i32,
    pub upload_rate: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: i64,
    pub server_id: i64,
    pub public_key: String,
    pub private_key: String,
    /// Bare /32 host address inside the server's /24, no prefix.
    pub peer_address: String,
    /// What the namespace routes to this peer; independent of the kernel
    /// peer entry, which always holds `peer_address/32`.
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
    pub comment: String,
    pub enable_forwarding: bool,
    pub forward_interface: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPeer {
    pub server_id: i64,
    pub public_key: String,
    pub private_key: String,
    pub peer_address: String,
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
    pub comment: String,
    pub enable_forwarding: bool,
    pub forward_interface: String,
}

/// Field-wise peer update; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct PeerChanges {
    pub allowed_ips: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub comment: Option<String>,
    pub enable_forwarding: Option<bool>,
    pub forward_interface: Option<String>,
}

impl PeerChanges {
    pub fn is_empty(&self) -> bool {
        self.allowed_ips.is_none()
            && self.persistent_keepalive.is_none()
            && self.comment.is_none()
            && self.enable_forwarding.is_none()
            && self.forward_interface.is_none()
    }
}

pub trait ServerCatalog: Send + Sync {
    fn server_for_user(
        &self,
        user_id: i64,
    ) -> impl Future<Output = Result<Option<ServerRecord>, CatalogError>> + Send;
}

pub trait PeerCatalog: Send + Sync {
    fn insert_peer(
        &self,
        peer: NewPeer,
    ) -> impl Future<Output = Result<PeerRecord, CatalogError>> + Send;

    fn get_peer(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<PeerRecord>, CatalogError>> + Send;

    /// Peers of a server, ordered by id ascending.
    fn list_peers(
        &self,
        server_id: i64,
    ) -> impl Future<Output = Result<Vec<PeerRecord>, CatalogError>> + Send;

    fn update_peer(
        &self,
        id: i64,
        changes: PeerChanges,
    ) -> impl Future<Output = Result<PeerRecord, CatalogError>> + Send;

    fn delete_peer(&self, id: i64) -> impl Future<Output = Result<(), CatalogError>> + Send;
}
