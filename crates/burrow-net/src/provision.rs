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

//! Per-user network bring-up and teardown.
//!
//! Every network parameter is a pure function of the user's 8-hex uid and the
//! operator config, so provisioning needs no coordination: two users can
//! never race over the same namespace, veth or port (a hash collision on the
//! subnet id is rejected up front instead).

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cmd::CmdError;
use crate::netns::HostNet;
use crate::wireguard::{WgConfig, WgError, WgRuntime};

/// Operator-level network settings, fixed at process startup.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Root of the per-user WireGuard config trees.
    pub config_dir: PathBuf,
    /// First two octets of the veth overlay, e.g. `"10.200"`.
    pub base_subnet: String,
    /// UDP port floor; the per-user offset is added modulo 10000.
    pub base_port: u16,
    /// External NIC used for MASQUERADE and DNAT.
    pub out_interface: String,
    /// Public IP advertised in client config endpoints.
    pub server_ip: String,
}

/// FNV-1a, 32 bit. Stable across runs and platforms; every derived per-user
/// parameter hangs off this value.
pub fn fnv1a32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// All network parameters derived from a user uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedNet {
    pub ns_name: String,
    pub wg_interface: String,
    pub wg_port: u16,
    /// Subnet id, 1..=254; selects both the /30 veth subnet and the /24
    /// WireGuard subnet.
    pub sid: u8,
    pub veth_host: String,
    pub veth_ns: String,
    pub veth_subnet: String,
    pub host_cidr: String,
    pub ns_cidr: String,
    /// Namespace-side veth address without the prefix; DNAT target.
    pub ns_ip: String,
    pub wg_address: String,
}

/// Derive the complete parameter set for `user_uid`. Pure; the same uid and
/// config always yield the same result.
pub fn derive(user_uid: &str, cfg: &NetworkConfig) -> DerivedNet {
    let hash = fnv1a32(user_uid);
    let sid = (hash % 254 + 1) as u8;
    let wg_port = (u32::from(cfg.base_port) + hash % 10_000) as u16;

    // Linux interface names cap at 15 bytes; 6 uid chars keep us under it.
    let short = &user_uid[..user_uid.len().min(6)];

    DerivedNet {
        ns_name: format!("wg_{user_uid}"),
        wg_interface: "wg0".to_owned(),
        wg_port,
        sid,
        veth_host: format!("veth-h-{short}"),
        veth_ns: format!("veth-ns-{short}"),
        veth_subnet: format!("{}.{sid}.0/30", cfg.base_subnet),
        host_cidr: format!("{}.{sid}.1/30", cfg.base_subnet),
        ns_cidr: format!("{}.{sid}.2/30", cfg.base_subnet),
        ns_ip: format!("{}.{sid}.2", cfg.base_subnet),
        wg_address: format!("10.100.{sid}.1/24"),
    }
}

fn is_valid_uid(uid: &str) -> bool {
    uid.len() == 8 && uid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("user uid {0:?} is not 8 lowercase hex characters")]
    InvalidUid(String),

    #[error("namespace {0} already exists")]
    NamespaceExists(String),

    #[error(transparent)]
    Command(#[from] CmdError),

    #[error(transparent)]
    Wireguard(#[from] WgError),
}

/// The server descriptor handed back for persistence. If persisting it
/// fails, the caller invokes [`Provisioner::destroy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedServer {
    pub namespace: String,
    pub wg_interface: String,
    pub wg_port: u16,
    pub wg_public_key: String,
    pub wg_private_key: String,
    pub wg_address: String,
}

/// Highest step of the bring-up saga that completed; rollback walks down
/// from here in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Step {
    Nothing,
    Namespace,
    Veth,
    HostNat,
    Config,
    Running,
}

pub struct Provisioner<H, W> {
    host: H,
    wg: W,
    cfg: NetworkConfig,
}

impl<H: HostNet, W: WgRuntime> Provisioner<H, W> {
    pub fn new(host: H, wg: W, cfg: NetworkConfig) -> Self {
        Self { host, wg, cfg }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.cfg
    }

    /// Stand up the complete per-user stack: namespace, veth, host NAT,
    /// keys, config, WireGuard, DNAT. On any failure every completed step
    /// is compensated in reverse order before the error is returned.
    #[tracing::instrument(skip(self))]
    pub async fn provision(&self, user_uid: &str) -> Result<ProvisionedServer, ProvisionError> {
        if !is_valid_uid(user_uid) {
            return Err(ProvisionError::InvalidUid(user_uid.to_owned()));
        }

        let net = derive(user_uid, &self.cfg);
        info!(
            namespace = %net.ns_name,
            wg_port = net.wg_port,
            sid = net.sid,
            "provisioning user network"
        );

        if self.host.namespace_exists(&net.ns_name).await? {
            return Err(ProvisionError::NamespaceExists(net.ns_name));
        }

        match self.bring_up(user_uid, &net).await {
            Ok(server) => {
                info!(namespace = %net.ns_name, "user network up");
                Ok(server)
            }
            Err((reached, err)) => {
                warn!(namespace = %net.ns_name, error = %err, "provisioning failed, rolling back");
                self.roll_back(user_uid, &net, reached).await;
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        user_uid: &str,
        net: &DerivedNet,
    ) -> Result<ProvisionedServer, (Step, ProvisionError)> {
        self.host
            .namespace_create(&net.ns_name)
            .await
            .map_err(|e| (Step::Nothing, e.into()))?;

        self.host
            .veth_create(
                &net.veth_host,
                &net.veth_ns,
                &net.ns_name,
                &net.ns_cidr,
                &net.host_cidr,
            )
            .await
            .map_err(|e| (Step::Namespace, e.into()))?;

        self.host
            .enable_host_nat(&net.veth_subnet, &self.cfg.out_interface)
            .await
            .map_err(|e| (Step::Veth, e.into()))?;

        let keys = self
            .wg
            .generate_keys()
            .await
            .map_err(|e| (Step::HostNat, e.into()))?;

        let wg_config = WgConfig {
            interface: net.wg_interface.clone(),
            listen_port: net.wg_port,
            private_key: keys.private_key.clone(),
            address: net.wg_address.clone(),
            veth_iface: net.veth_ns.clone(),
            out_interface: self.cfg.out_interface.clone(),
        };
        let config_path = self
            .wg
            .write_config(user_uid, &wg_config)
            .await
            .map_err(|e| (Step::HostNat, e.into()))?;

        self.wg
            .start_in_namespace(&net.ns_name, &config_path)
            .await
            .map_err(|e| (Step::Config, e.into()))?;

        self.host
            .publish_dnat(
                &self.cfg.out_interface,
                net.wg_port,
                &net.ns_ip,
                net.wg_port,
                "udp",
            )
            .await
            .map_err(|e| (Step::Running, e.into()))?;

        Ok(ProvisionedServer {
            namespace: net.ns_name.clone(),
            wg_interface: net.wg_interface.clone(),
            wg_port: net.wg_port,
            wg_public_key: keys.public_key,
            wg_private_key: keys.private_key,
            wg_address: net.wg_address.clone(),
        })
    }

    /// Compensate completed steps, best effort, most recent first.
    async fn roll_back(&self, user_uid: &str, net: &DerivedNet, reached: Step) {
        if reached >= Step::Running {
            let config_path = self.wg.config_path(user_uid, &net.wg_interface);
            if let Err(e) = self.wg.stop_in_namespace(&net.ns_name, &config_path).await {
                warn!(namespace = %net.ns_name, error = %e, "rollback: wg-quick down failed");
            }
        }

        if reached >= Step::Config {
            if let Err(e) = self.wg.remove_config(user_uid, &net.wg_interface).await {
                warn!(namespace = %net.ns_name, error = %e, "rollback: config removal failed");
            }
        }

        if reached >= Step::HostNat {
            if let Err(e) = self
                .host
                .disable_host_nat(&net.veth_subnet, &self.cfg.out_interface)
                .await
            {
                warn!(namespace = %net.ns_name, error = %e, "rollback: host NAT removal failed");
            }
        }

        if reached >= Step::Namespace {
            // Takes the veth pair and all in-namespace state with it.
            if let Err(e) = self.host.namespace_delete(&net.ns_name).await {
                warn!(namespace = %net.ns_name, error = %e, "rollback: namespace delete failed");
            }
        }
    }

    /// Tear down a user network, tolerating partial or absent state. The
    /// namespace delete is the authoritative step; everything before it is
    /// best effort. Succeeds for a uid that was never provisioned.
    ///
    /// `wg_port` comes from the persisted server row so a changed
    /// `base_port` cannot strand old DNAT rules.
    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self, user_uid: &str, wg_port: u16) -> Result<(), ProvisionError> {
        let net = derive(user_uid, &self.cfg);

        if let Err(e) = self
            .host
            .unpublish_dnat(&self.cfg.out_interface, wg_port, &net.ns_ip, wg_port, "udp")
            .await
        {
            warn!(namespace = %net.ns_name, error = %e, "destroy: unpublish DNAT failed");
        }

        let config_path = self.wg.config_path(user_uid, &net.wg_interface);
        if let Err(e) = self.wg.stop_in_namespace(&net.ns_name, &config_path).await {
            debug!(namespace = %net.ns_name, error = %e, "destroy: wg-quick down failed (continuing)");
        }

        if let Err(e) = self
            .host
            .disable_host_nat(&net.veth_subnet, &self.cfg.out_interface)
            .await
        {
            warn!(namespace = %net.ns_name, error = %e, "destroy: host NAT removal failed");
        }

        if self.host.namespace_exists(&net.ns_name).await? {
            self.host.namespace_delete(&net.ns_name).await?;
            info!(namespace = %net.ns_name, "user network destroyed");
        } else {
            debug!(namespace = %net.ns_name, "destroy: namespace absent, nothing to do");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            config_dir: "/etc/burrow/wireguard".into(),
            base_subnet: "10.200".to_owned(),
            base_port: 51820,
            out_interface: "eth0".to_owned(),
            server_ip: "203.0.113.10".to_owned(),
        }
    }

    // Reference vectors, computed independently.
    #[test_case("a1b2c3d4", 3_789_875_581 ; "a1b2c3d4")]
    #[test_case("deadbeef", 3_493_560_501 ; "deadbeef")]
    #[test_case("00000000", 267_615_717 ; "zeros")]
    fn fnv_reference_vectors(input: &str, expected: u32) {
        assert_eq!(fnv1a32(input), expected);
    }

    #[test]
    fn derive_known_uid() {
        let net = derive("a1b2c3d4", &test_config());

        // fnv1a32("a1b2c3d4") = 3789875581; % 10000 = 5581; % 254 + 1 = 2.
        assert_eq!(net.ns_name, "wg_a1b2c3d4");
        assert_eq!(net.wg_interface, "wg0");
        assert_eq!(net.wg_port, 51820 + 5581);
        assert_eq!(net.sid, 2);
        assert_eq!(net.veth_host, "veth-h-a1b2c3");
        assert_eq!(net.veth_ns, "veth-ns-a1b2c3");
        assert_eq!(net.veth_subnet, "10.200.2.0/30");
        assert_eq!(net.host_cidr, "10.200.2.1/30");
        assert_eq!(net.ns_cidr, "10.200.2.2/30");
        assert_eq!(net.ns_ip, "10.200.2.2");
        assert_eq!(net.wg_address, "10.100.2.1/24");
    }

    #[test]
    fn derive_is_deterministic() {
        let cfg = test_config();
        assert_eq!(derive("cafef00d", &cfg), derive("cafef00d", &cfg));
    }

    #[test]
    fn sid_always_in_range() {
        let cfg = test_config();
        for uid in ["00000000", "ffffffff", "0badc0de", "cafef00d", "a1b2c3d4"] {
            let net = derive(uid, &cfg);
            assert!((1..=254).contains(&net.sid), "sid {} for {uid}", net.sid);
            assert!(net.wg_port >= cfg.base_port);
            assert!(u32::from(net.wg_port) < u32::from(cfg.base_port) + 10_000);
        }
    }

    #[test]
    fn interface_names_fit_linux_limit() {
        let net = derive("a1b2c3d4", &test_config());
        assert!(net.veth_host.len() <= 15);
        assert!(net.veth_ns.len() <= 15);
    }

    #[test_case("a1b2c3d" ; "too short")]
    #[test_case("a1b2c3d44" ; "too long")]
    #[test_case("A1B2C3D4" ; "uppercase")]
    #[test_case("a1b2c3dz" ; "non hex")]
    fn rejects_bad_uids(uid: &str) {
        assert!(!is_valid_uid(uid));
    }

    #[test]
    fn accepts_good_uid() {
        assert!(is_valid_uid("a1b2c3d4"));
    }
}
