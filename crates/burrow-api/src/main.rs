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

mod auth;
mod config;
mod db;
mod error;
mod extract;
mod locks;
mod routes;

use actix_web::{web, App, HttpResponse, HttpServer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::user::{UserRole, UserStore};
use crate::db::wireguard::WgStore;
use crate::locks::ServerLocks;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("GIT_VERSION"),
    }))
}

const DEFAULT_ADMIN_EMAIL: &str = "admin@platform.com";
const DEFAULT_ADMIN_PASSWORD: &str = "password";

/// Seed an admin account on an empty instance. A failure to provision the
/// admin's network is logged, not fatal: the account exists and the operator
/// can delete/recreate it once the host is fixed.
async fn ensure_default_admin(
    users: &UserStore,
    servers: &WgStore,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    if users.has_admin().await? {
        return Ok(());
    }

    let admin = users
        .create(DEFAULT_ADMIN_EMAIL, "admin", DEFAULT_ADMIN_PASSWORD, UserRole::Admin)
        .await?;
    warn!(
        email = DEFAULT_ADMIN_EMAIL,
        "created default admin with the default password, change it"
    );

    let provisioner = routes::provisioner(config);
    match provisioner.provision(&admin.user_uid).await {
        Ok(provisioned) => {
            if let Err(e) = servers.create_server(admin.id, &provisioned).await {
                error!(error = %e, "failed to persist admin server, destroying network");
                if let Err(e) = provisioner.destroy(&admin.user_uid, provisioned.wg_port).await {
                    error!(error = %e, "admin network teardown also failed");
                }
            } else {
                info!(user_uid = %admin.user_uid, "default admin network up");
            }
        }
        Err(e) => {
            warn!(
                user_uid = %admin.user_uid,
                error = %e,
                "default admin created without a network"
            );
        }
    }

    Ok(())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().expect("failed to load configuration");
    info!(
        addr = %config.bind_addr,
        out_interface = %config.network.out_interface,
        version = env!("GIT_VERSION"),
        "starting burrow-api"
    );

    let pool = db::create_pool(&config.database_url).await;
    db::migrate(&pool).await;
    info!("database migrations applied");

    let user_store = UserStore::new(pool.clone());
    let wg_store = WgStore::new(pool.clone());

    ensure_default_admin(&user_store, &wg_store, &config)
        .await
        .expect("failed to seed default admin");

    let bind = config.bind_addr.clone();

    let config_data = web::Data::new(config);
    let user_data = web::Data::new(user_store);
    let wg_data = web::Data::new(wg_store);
    let locks_data = web::Data::new(ServerLocks::new());

    HttpServer::new(move || {
        App::new()
            .app_data(config_data.clone())
            .app_data(user_data.clone())
            .app_data(wg_data.clone())
            .app_data(locks_data.clone())
            .wrap(tracing_actix_web::TracingLogger::default())
            .route("/health", web::get().to(health))
            .configure(routes::auth::configure)
            .configure(routes::wireguard::configure)
            .configure(routes::admin::configure)
    })
    .bind(&bind)?
    .run()
    .await
}
