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

//! Server and peer rows, plus the [`burrow_net::catalog`] contract the peer
//! controller drives.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use burrow_net::catalog::{
    CatalogError, NewPeer, PeerCatalog, PeerChanges, PeerRecord, ServerCatalog, ServerRecord,
};
use burrow_net::provision::ProvisionedServer;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRow {
    pub id: i64,
    pub user_id: i64,
    pub namespace: String,
    pub wg_interface: String,
    pub wg_port: i32,
    pub wg_public_key: String,
    pub wg_private_key: String,
    pub wg_address: String,
    pub enabled: bool,
    pub download_rate: i32,
    pub upload_rate: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRow {
    pub fn to_record(&self) -> ServerRecord {
        ServerRecord {
            id: self.id,
            user_id: self.user_id,
            namespace: self.namespace.clone(),
            wg_interface: self.wg_interface.clone(),
            wg_port: self.wg_port as u16,
            wg_public_key: self.wg_public_key.clone(),
            wg_private_key: self.wg_private_key.clone(),
            wg_address: self.wg_address.clone(),
            enabled: self.enabled,
            download_rate: self.download_rate,
            upload_rate: self.upload_rate,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PeerRow {
    pub id: i64,
    pub server_id: i64,
    pub public_key: String,
    pub private_key: String,
    pub peer_address: String,
    pub allowed_ips: String,
    pub persistent_keepalive: i32,
    pub comment: String,
    pub enable_forwarding: bool,
    pub forward_interface: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PeerRow {
    pub fn to_record(&self) -> PeerRecord {
        PeerRecord {
            id: self.id,
            server_id: self.server_id,
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
            peer_address: self.peer_address.clone(),
            allowed_ips: self.allowed_ips.clone(),
            persistent_keepalive: self.persistent_keepalive as u16,
            comment: self.comment.clone(),
            enable_forwarding: self.enable_forwarding,
            forward_interface: self.forward_interface.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WgStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("user already has a server")]
    DuplicateServer,

    #[error("namespace or port already in use")]
    DerivedParamsTaken,
}

type Result<T> = std::result::Result<T, WgStoreError>;

#[derive(Debug, Clone)]
pub struct WgStore {
    pool: PgPool,
}

impl WgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, server), fields(namespace = %server.namespace))]
    pub async fn create_server(&self, user_id: i64, server: &ProvisionedServer) -> Result<ServerRow> {
        sqlx::query_as::<_, ServerRow>(
            "INSERT INTO wireguard_servers
                 (user_id, namespace, wg_interface, wg_port, wg_public_key, wg_private_key, wg_address)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(user_id)
        .bind(&server.namespace)
        .bind(&server.wg_interface)
        .bind(i32::from(server.wg_port))
        .bind(&server.wg_public_key)
        .bind(&server.wg_private_key)
        .bind(&server.wg_address)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) => match db_err.constraint() {
                Some("wireguard_servers_user_id_key") => WgStoreError::DuplicateServer,
                Some("wireguard_servers_namespace_key")
                | Some("wireguard_servers_wg_port_key") => WgStoreError::DerivedParamsTaken,
                _ => WgStoreError::Database(e),
            },
            _ => WgStoreError::Database(e),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn server_for_user(&self, user_id: i64) -> Result<Option<ServerRow>> {
        sqlx::query_as::<_, ServerRow>("SELECT * FROM wireguard_servers WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_server(&self, id: i64) -> Result<Option<ServerRow>> {
        sqlx::query_as::<_, ServerRow>("SELECT * FROM wireguard_servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_servers(&self) -> Result<Vec<ServerRow>> {
        sqlx::query_as::<_, ServerRow>("SELECT * FROM wireguard_servers ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// True when any persisted server already holds one of the derived
    /// parameters (hash collision with another uid).
    #[tracing::instrument(skip(self))]
    pub async fn derived_params_taken(&self, namespace: &str, wg_port: u16) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM wireguard_servers WHERE namespace = $1 OR wg_port = $2
             )",
        )
        .bind(namespace)
        .bind(i32::from(wg_port))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Remove a server and all of its peers in one transaction.
    #[tracing::instrument(skip(self))]
    pub async fn delete_server_with_peers(&self, server_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM wireguard_peers WHERE server_id = $1")
            .bind(server_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM wireguard_servers WHERE id = $1")
            .bind(server_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_enabled(&self, server_id: i64, enabled: bool) -> Result<Option<ServerRow>> {
        sqlx::query_as::<_, ServerRow>(
            "UPDATE wireguard_servers SET enabled = $2, updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(server_id)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_rate_limits(
        &self,
        server_id: i64,
        download_rate: i32,
        upload_rate: i32,
    ) -> Result<Option<ServerRow>> {
        sqlx::query_as::<_, ServerRow>(
            "UPDATE wireguard_servers SET download_rate = $2, upload_rate = $3, updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(server_id)
        .bind(download_rate)
        .bind(upload_rate)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn peers_for_server(&self, server_id: i64) -> Result<Vec<PeerRow>> {
        sqlx::query_as::<_, PeerRow>(
            "SELECT * FROM wireguard_peers WHERE server_id = $1 ORDER BY id",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_peer_row(&self, id: i64) -> Result<Option<PeerRow>> {
        sqlx::query_as::<_, PeerRow>("SELECT * FROM wireguard_peers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }
}

// The peer controller drives the store through the core's catalog contract.

impl ServerCatalog for WgStore {
    async fn server_for_user(
        &self,
        user_id: i64,
    ) -> std::result::Result<Option<ServerRecord>, CatalogError> {
        let row = WgStore::server_for_user(self, user_id)
            .await
            .map_err(CatalogError::new)?;
        Ok(row.map(|r| r.to_record()))
    }
}

impl PeerCatalog for WgStore {
    async fn insert_peer(&self, peer: NewPeer) -> std::result::Result<PeerRecord, CatalogError> {
        sqlx::query_as::<_, PeerRow>(
            "INSERT INTO wireguard_peers
                 (server_id, public_key, private_key, peer_address, allowed_ips,
                  persistent_keepalive, comment, enable_forwarding, forward_interface)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING *",
        )
        .bind(peer.server_id)
        .bind(&peer.public_key)
        .bind(&peer.private_key)
        .bind(&peer.peer_address)
        .bind(&peer.allowed_ips)
        .bind(i32::from(peer.persistent_keepalive))
        .bind(&peer.comment)
        .bind(peer.enable_forwarding)
        .bind(&peer.forward_interface)
        .fetch_one(&self.pool)
        .await
        .map(|row| row.to_record())
        .map_err(CatalogError::new)
    }

    async fn get_peer(&self, id: i64) -> std::result::Result<Option<PeerRecord>, CatalogError> {
        let row = self.get_peer_row(id).await.map_err(CatalogError::new)?;
        Ok(row.map(|r| r.to_record()))
    }

    async fn list_peers(
        &self,
        server_id: i64,
    ) -> std::result::Result<Vec<PeerRecord>, CatalogError> {
        let rows = self
            .peers_for_server(server_id)
            .await
            .map_err(CatalogError::new)?;
        Ok(rows.iter().map(PeerRow::to_record).collect())
    }

    async fn update_peer(
        &self,
        id: i64,
        changes: PeerChanges,
    ) -> std::result::Result<PeerRecord, CatalogError> {
        sqlx::query_as::<_, PeerRow>(
            "UPDATE wireguard_peers SET
                 allowed_ips = COALESCE($2, allowed_ips),
                 persistent_keepalive = COALESCE($3, persistent_keepalive),
                 comment = COALESCE($4, comment),
                 enable_forwarding = COALESCE($5, enable_forwarding),
                 forward_interface = COALESCE($6, forward_interface),
                 updated_at = now()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(changes.allowed_ips)
        .bind(changes.persistent_keepalive.map(i32::from))
        .bind(changes.comment)
        .bind(changes.enable_forwarding)
        .bind(changes.forward_interface)
        .fetch_one(&self.pool)
        .await
        .map(|row| row.to_record())
        .map_err(CatalogError::new)
    }

    async fn delete_peer(&self, id: i64) -> std::result::Result<(), CatalogError> {
        sqlx::query("DELETE FROM wireguard_peers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(CatalogError::new)?;
        Ok(())
    }
}
