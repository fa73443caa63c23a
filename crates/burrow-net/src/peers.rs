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

//! Peer lifecycle: create, update and remove peers while keeping the
//! catalog, the kernel peer table and the in-namespace route/filter state
//! consistent with each other.
//!
//! Concurrent sagas against the same server must be serialized by the
//! caller (the API holds a per-server lock); sagas for different servers
//! never share kernel names and are free to interleave.

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::{info, warn};

use crate::alloc::{self, AllocError};
use crate::catalog::{
    CatalogError, NewPeer, PeerCatalog, PeerChanges, PeerRecord, ServerCatalog, ServerRecord,
};
use crate::cmd::CmdError;
use crate::netns::{split_cidr_list, HostNet};
use crate::wireguard::{WgError, WgRuntime};

pub const DEFAULT_KEEPALIVE: u16 = 25;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("user has no provisioned server")]
    NoServer,

    #[error("peer not found")]
    NotFound,

    #[error("peer belongs to a different server")]
    NotOwned,

    #[error("invalid allowed_ips entry {0:?}")]
    InvalidAllowedIps(String),

    #[error("no fields to update")]
    NoChanges,

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Command(#[from] CmdError),

    #[error(transparent)]
    Wireguard(#[from] WgError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Default)]
pub struct AddPeerRequest {
    /// What the peer may route into the namespace; empty means "just the
    /// peer's own address".
    pub allowed_ips: String,
    pub persistent_keepalive: Option<u16>,
    pub comment: String,
    pub enable_forwarding: bool,
    pub forward_interface: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePeerRequest {
    pub allowed_ips: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub comment: Option<String>,
    pub enable_forwarding: Option<bool>,
    pub forward_interface: Option<String>,
}

/// An `allowed_ips` value is trivial when it names nothing beyond the peer
/// itself (or the catch-all, which WireGuard's own routing covers): trivial
/// values need no in-namespace route or FORWARD rules.
fn is_trivial(allowed_ips: &str, peer_address: &str) -> bool {
    allowed_ips == format!("{peer_address}/32") || allowed_ips == "0.0.0.0/0"
}

fn validate_allowed_ips(list: &str) -> Result<(), PeerError> {
    let mut entries = 0usize;
    for entry in split_cidr_list(list) {
        entry
            .parse::<Ipv4Network>()
            .map_err(|_| PeerError::InvalidAllowedIps(entry.to_owned()))?;
        entries += 1;
    }
    if entries == 0 {
        return Err(PeerError::InvalidAllowedIps(list.to_owned()));
    }
    Ok(())
}

pub struct PeerController<H, W, C> {
    host: H,
    wg: W,
    catalog: C,
}

impl<H, W, C> PeerController<H, W, C>
where
    H: HostNet,
    W: WgRuntime,
    C: ServerCatalog + PeerCatalog,
{
    pub fn new(host: H, wg: W, catalog: C) -> Self {
        Self { host, wg, catalog }
    }

    async fn owned_peer(&self, server_id: i64, peer_id: i64) -> Result<PeerRecord, PeerError> {
        let peer = self
            .catalog
            .get_peer(peer_id)
            .await?
            .ok_or(PeerError::NotFound)?;
        if peer.server_id != server_id {
            return Err(PeerError::NotOwned);
        }
        Ok(peer)
    }

    /// Create a peer: allocate an address, persist it, upsert the kernel
    /// entry (always the peer's own /32) and, for a non-trivial
    /// `allowed_ips`, install the namespace route and FORWARD rules. Any
    /// failure unwinds the completed steps in reverse.
    #[tracing::instrument(skip(self, req))]
    pub async fn add_peer(
        &self,
        user_id: i64,
        req: AddPeerRequest,
    ) -> Result<PeerRecord, PeerError> {
        let server = self
            .catalog
            .server_for_user(user_id)
            .await?
            .ok_or(PeerError::NoServer)?;

        if !req.allowed_ips.trim().is_empty() {
            validate_allowed_ips(&req.allowed_ips)?;
        }

        let keys = self.wg.generate_keys().await?;

        let existing = self.catalog.list_peers(server.id).await?;
        let taken: Vec<&str> = existing.iter().map(|p| p.peer_address.as_str()).collect();
        let peer_address = alloc::allocate_peer_ip(&server.wg_address, &taken)?;

        let allowed_ips = if req.allowed_ips.trim().is_empty() {
            format!("{peer_address}/32")
        } else {
            req.allowed_ips.trim().to_owned()
        };

        let persistent_keepalive = match req.persistent_keepalive {
            Some(k) if k > 0 => k,
            _ => DEFAULT_KEEPALIVE,
        };

        let peer = self
            .catalog
            .insert_peer(NewPeer {
                server_id: server.id,
                public_key: keys.public_key.clone(),
                private_key: keys.private_key,
                peer_address: peer_address.clone(),
                allowed_ips: allowed_ips.clone(),
                persistent_keepalive,
                comment: req.comment,
                enable_forwarding: req.enable_forwarding,
                forward_interface: req.forward_interface,
            })
            .await?;

        // The kernel entry is always the peer's own /32; the catalog field
        // only drives namespace routing below.
        let kernel_ips = format!("{peer_address}/32");
        if let Err(err) = self
            .wg
            .set_peer(
                &server.namespace,
                &server.wg_interface,
                &keys.public_key,
                &kernel_ips,
                None,
            )
            .await
        {
            self.drop_peer_row(peer.id).await;
            return Err(err.into());
        }

        if !is_trivial(&allowed_ips, &peer_address) {
            if let Err(err) = self
                .host
                .ns_route_add(&server.namespace, &server.wg_interface, &allowed_ips)
                .await
            {
                self.remove_kernel_peer(&server.namespace, &server.wg_interface, &keys.public_key)
                    .await;
                self.drop_peer_row(peer.id).await;
                return Err(err.into());
            }

            if let Err(err) = self
                .host
                .ns_forward_allow(&server.namespace, &allowed_ips)
                .await
            {
                if let Err(e) = self
                    .host
                    .ns_route_del(&server.namespace, &server.wg_interface, &allowed_ips)
                    .await
                {
                    warn!(error = %e, "unwind: route removal failed");
                }
                self.remove_kernel_peer(&server.namespace, &server.wg_interface, &keys.public_key)
                    .await;
                self.drop_peer_row(peer.id).await;
                return Err(err.into());
            }
        }

        info!(
            server_id = server.id,
            peer_id = peer.id,
            peer_address = %peer_address,
            "peer added"
        );
        Ok(peer)
    }

    /// Update catalog fields; when `allowed_ips` changes, swap the namespace
    /// route/FORWARD rules first and only commit the row once the kernel
    /// state is in place. On failure the old rules are restored best-effort
    /// and the row is left untouched.
    #[tracing::instrument(skip(self, req))]
    pub async fn update_peer(
        &self,
        user_id: i64,
        peer_id: i64,
        req: UpdatePeerRequest,
    ) -> Result<PeerRecord, PeerError> {
        let server = self
            .catalog
            .server_for_user(user_id)
            .await?
            .ok_or(PeerError::NoServer)?;
        let peer = self.owned_peer(server.id, peer_id).await?;

        // An empty allowed_ips in an update is "leave unchanged".
        let new_allowed = req
            .allowed_ips
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != peer.allowed_ips)
            .map(str::to_owned);

        let changes = PeerChanges {
            allowed_ips: new_allowed.clone(),
            persistent_keepalive: req.persistent_keepalive,
            comment: req.comment,
            enable_forwarding: req.enable_forwarding,
            forward_interface: req.forward_interface,
        };
        if changes.is_empty() {
            return Err(PeerError::NoChanges);
        }

        if let Some(ref new_allowed) = new_allowed {
            validate_allowed_ips(new_allowed)?;

            let old_materialized = !is_trivial(&peer.allowed_ips, &peer.peer_address);
            let new_materialized = !is_trivial(new_allowed, &peer.peer_address);

            if old_materialized {
                if let Err(e) = self
                    .host
                    .ns_forward_disallow(&server.namespace, &peer.allowed_ips)
                    .await
                {
                    warn!(error = %e, "old forward rules removal failed");
                }
                if let Err(e) = self
                    .host
                    .ns_route_del(&server.namespace, &server.wg_interface, &peer.allowed_ips)
                    .await
                {
                    warn!(error = %e, "old route removal failed");
                }
            }

            if new_materialized {
                if let Err(err) = self
                    .host
                    .ns_route_add(&server.namespace, &server.wg_interface, new_allowed)
                    .await
                {
                    self.restore_rules(&server, &peer, old_materialized).await;
                    return Err(err.into());
                }
                if let Err(err) = self
                    .host
                    .ns_forward_allow(&server.namespace, new_allowed)
                    .await
                {
                    if let Err(e) = self
                        .host
                        .ns_route_del(&server.namespace, &server.wg_interface, new_allowed)
                        .await
                    {
                        warn!(error = %e, "unwind: new route removal failed");
                    }
                    self.restore_rules(&server, &peer, old_materialized).await;
                    return Err(err.into());
                }
            }
        }

        let updated = self.catalog.update_peer(peer.id, changes).await?;
        info!(server_id = server.id, peer_id = peer.id, "peer updated");
        Ok(updated)
    }

    /// Remove a peer: rules and route go best-effort, the kernel peer entry
    /// is authoritative (on failure the row is kept so the operator can
    /// retry), then the row is deleted.
    #[tracing::instrument(skip(self))]
    pub async fn remove_peer(&self, user_id: i64, peer_id: i64) -> Result<(), PeerError> {
        let server = self
            .catalog
            .server_for_user(user_id)
            .await?
            .ok_or(PeerError::NoServer)?;
        let peer = self.owned_peer(server.id, peer_id).await?;

        if let Err(e) = self
            .host
            .ns_forward_disallow(&server.namespace, &peer.allowed_ips)
            .await
        {
            warn!(peer_id, error = %e, "forward rules removal failed");
        }
        if let Err(e) = self
            .host
            .ns_route_del(&server.namespace, &server.wg_interface, &peer.allowed_ips)
            .await
        {
            warn!(peer_id, error = %e, "route removal failed");
        }

        self.wg
            .remove_peer(&server.namespace, &server.wg_interface, &peer.public_key)
            .await?;

        self.catalog.delete_peer(peer.id).await?;
        info!(server_id = server.id, peer_id, "peer removed");
        Ok(())
    }

    async fn restore_rules(&self, server: &ServerRecord, peer: &PeerRecord, old_materialized: bool) {
        if !old_materialized {
            return;
        }
        if let Err(e) = self
            .host
            .ns_route_add(&server.namespace, &server.wg_interface, &peer.allowed_ips)
            .await
        {
            warn!(error = %e, "restore: route add failed");
        }
        if let Err(e) = self
            .host
            .ns_forward_allow(&server.namespace, &peer.allowed_ips)
            .await
        {
            warn!(error = %e, "restore: forward rules failed");
        }
    }

    async fn remove_kernel_peer(&self, ns: &str, iface: &str, public_key: &str) {
        if let Err(e) = self.wg.remove_peer(ns, iface, public_key).await {
            warn!(error = %e, "unwind: kernel peer removal failed");
        }
    }

    async fn drop_peer_row(&self, peer_id: i64) {
        if let Err(e) = self.catalog.delete_peer(peer_id).await {
            warn!(peer_id, error = %e, "unwind: catalog row removal failed");
        }
    }
}
