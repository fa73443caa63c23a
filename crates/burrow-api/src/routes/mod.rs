pub mod admin;
pub mod auth;
pub mod wireguard;

use burrow_net::peers::PeerController;
use burrow_net::provision::Provisioner;
use burrow_net::{SysHostNet, SysWg};

use crate::config::Config;
use crate::db::wireguard::WgStore;

/// The privileged adapters carry no state, so every handler builds its own
/// provisioner/controller from the process config.
pub(crate) fn provisioner(config: &Config) -> Provisioner<SysHostNet, SysWg> {
    Provisioner::new(
        SysHostNet::new(),
        SysWg::new(config.network.config_dir.clone()),
        config.network.clone(),
    )
}

pub(crate) fn peer_controller(
    config: &Config,
    store: WgStore,
) -> PeerController<SysHostNet, SysWg, WgStore> {
    PeerController::new(
        SysHostNet::new(),
        SysWg::new(config.network.config_dir.clone()),
        store,
    )
}
