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

//! Host network adapter: typed, stateless wrappers over `ip`, `iptables` and
//! `sysctl` for namespace, veth, NAT and in-namespace route/filter state.

use std::future::Future;

use tracing::{debug, info, warn};

use crate::cmd::{self, CmdError};

/// Every privileged host/namespace primitive the provisioner and the peer
/// controller drive. Production code uses [`SysHostNet`]; tests substitute a
/// recording mock.
pub trait HostNet: Send + Sync {
    fn namespace_create(&self, name: &str) -> impl Future<Output = Result<(), CmdError>> + Send;

    fn namespace_delete(&self, name: &str) -> impl Future<Output = Result<(), CmdError>> + Send;

    fn namespace_exists(&self, name: &str) -> impl Future<Output = Result<bool, CmdError>> + Send;

    /// Create a veth pair, move `ns_iface` into `ns_name`, address both ends
    /// and install the namespace default route via the host-side address.
    /// On failure the caller cleans up by deleting the namespace, which takes
    /// the moved end (and with it the host end) down with it.
    fn veth_create(
        &self,
        host_iface: &str,
        ns_iface: &str,
        ns_name: &str,
        ns_cidr: &str,
        host_cidr: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    /// Turn on `net.ipv4.ip_forward` (host-wide, never reverted) and install
    /// MASQUERADE + FORWARD rules for the veth subnet. Not idempotent: do not
    /// re-invoke for an already-provisioned user.
    fn enable_host_nat(
        &self,
        ns_subnet: &str,
        out_interface: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    /// Delete the rules installed by [`HostNet::enable_host_nat`], tolerating
    /// their absence. `ip_forward` stays on.
    fn disable_host_nat(
        &self,
        ns_subnet: &str,
        out_interface: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    fn publish_dnat(
        &self,
        out_interface: &str,
        external_port: u16,
        target_ip: &str,
        target_port: u16,
        proto: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    fn unpublish_dnat(
        &self,
        out_interface: &str,
        external_port: u16,
        target_ip: &str,
        target_port: u16,
        proto: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    fn exec_in_namespace(
        &self,
        ns_name: &str,
        argv: &[&str],
    ) -> impl Future<Output = Result<String, CmdError>> + Send;

    /// Install `ip route add <cidr> dev <iface>` inside the namespace for each
    /// comma-separated entry. "File exists" is success.
    fn ns_route_add(
        &self,
        ns_name: &str,
        iface: &str,
        cidr_list: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    /// Remove the per-entry routes. "No such process" / "not found" is success.
    fn ns_route_del(
        &self,
        ns_name: &str,
        iface: &str,
        cidr_list: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    /// Symmetric `FORWARD -d/-s <cidr> -j ACCEPT` rules inside the namespace.
    fn ns_forward_allow(
        &self,
        ns_name: &str,
        cidr_list: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;

    fn ns_forward_disallow(
        &self,
        ns_name: &str,
        cidr_list: &str,
    ) -> impl Future<Output = Result<(), CmdError>> + Send;
}

/// Split a free-form comma-separated CIDR list into trimmed, non-empty entries.
pub fn split_cidr_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn route_already_exists(err: &CmdError) -> bool {
    err.stderr().contains("File exists")
}

fn route_missing(err: &CmdError) -> bool {
    let stderr = err.stderr();
    stderr.contains("No such process") || stderr.contains("not found")
}

fn rule_missing(err: &CmdError) -> bool {
    let stderr = err.stderr();
    stderr.contains("does not exist")
        || stderr.contains("No chain/target/match by that name")
        || stderr.contains("Bad rule")
}

/// The production adapter: forks the privileged binaries on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysHostNet;

impl SysHostNet {
    pub fn new() -> Self {
        Self
    }

    async fn iptables_delete(&self, argv: &[&str]) -> Result<(), CmdError> {
        match cmd::run(argv).await {
            Ok(_) => Ok(()),
            Err(err) if rule_missing(&err) => {
                debug!(cmd = %argv.join(" "), "rule already absent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl HostNet for SysHostNet {
    async fn namespace_create(&self, name: &str) -> Result<(), CmdError> {
        cmd::run(&["ip", "netns", "add", name]).await?;
        info!(namespace = name, "created network namespace");
        Ok(())
    }

    async fn namespace_delete(&self, name: &str) -> Result<(), CmdError> {
        cmd::run(&["ip", "netns", "delete", name]).await?;
        info!(namespace = name, "deleted network namespace");
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, CmdError> {
        let out = cmd::run(&["ip", "netns", "list"]).await?;
        // Lines look like "name (id: 3)" or just "name".
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|ns| ns == name))
    }

    async fn veth_create(
        &self,
        host_iface: &str,
        ns_iface: &str,
        ns_name: &str,
        ns_cidr: &str,
        host_cidr: &str,
    ) -> Result<(), CmdError> {
        cmd::run(&[
            "ip", "link", "add", host_iface, "type", "veth", "peer", "name", ns_iface,
        ])
        .await?;
        cmd::run(&["ip", "link", "set", ns_iface, "netns", ns_name]).await?;
        cmd::run(&["ip", "link", "set", host_iface, "up"]).await?;
        cmd::run(&["ip", "addr", "add", host_cidr, "dev", host_iface]).await?;

        cmd::run(&["ip", "netns", "exec", ns_name, "ip", "link", "set", "lo", "up"]).await?;
        cmd::run(&["ip", "netns", "exec", ns_name, "ip", "link", "set", ns_iface, "up"]).await?;
        cmd::run(&[
            "ip", "netns", "exec", ns_name, "ip", "addr", "add", ns_cidr, "dev", ns_iface,
        ])
        .await?;

        // The host side of the /30 is the namespace's gateway.
        let gateway = host_cidr.split('/').next().unwrap_or(host_cidr);
        cmd::run(&[
            "ip", "netns", "exec", ns_name, "ip", "route", "add", "default", "via", gateway,
        ])
        .await?;

        info!(
            namespace = ns_name,
            host_iface,
            ns_iface,
            host_cidr,
            ns_cidr,
            "veth pair up"
        );
        Ok(())
    }

    async fn enable_host_nat(&self, ns_subnet: &str, out_interface: &str) -> Result<(), CmdError> {
        cmd::run(&["sysctl", "-w", "net.ipv4.ip_forward=1"]).await?;
        cmd::run(&[
            "iptables",
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            ns_subnet,
            "-o",
            out_interface,
            "-j",
            "MASQUERADE",
        ])
        .await?;
        cmd::run(&[
            "iptables", "-A", "FORWARD", "-i", out_interface, "-o", "veth+", "-j", "ACCEPT",
        ])
        .await?;
        cmd::run(&[
            "iptables", "-A", "FORWARD", "-o", out_interface, "-i", "veth+", "-j", "ACCEPT",
        ])
        .await?;

        info!(subnet = ns_subnet, out_interface, "host NAT enabled");
        Ok(())
    }

    async fn disable_host_nat(&self, ns_subnet: &str, out_interface: &str) -> Result<(), CmdError> {
        self.iptables_delete(&[
            "iptables",
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-s",
            ns_subnet,
            "-o",
            out_interface,
            "-j",
            "MASQUERADE",
        ])
        .await?;
        self.iptables_delete(&[
            "iptables", "-D", "FORWARD", "-i", out_interface, "-o", "veth+", "-j", "ACCEPT",
        ])
        .await?;
        self.iptables_delete(&[
            "iptables", "-D", "FORWARD", "-o", out_interface, "-i", "veth+", "-j", "ACCEPT",
        ])
        .await?;

        debug!(subnet = ns_subnet, out_interface, "host NAT rules removed");
        Ok(())
    }

    async fn publish_dnat(
        &self,
        out_interface: &str,
        external_port: u16,
        target_ip: &str,
        target_port: u16,
        proto: &str,
    ) -> Result<(), CmdError> {
        let external = external_port.to_string();
        let internal = target_port.to_string();
        let destination = format!("{target_ip}:{target_port}");

        cmd::run(&[
            "iptables", "-A", "INPUT", "-i", out_interface, "-p", proto, "--dport", &external,
            "-j", "ACCEPT",
        ])
        .await?;
        cmd::run(&[
            "iptables",
            "-t",
            "nat",
            "-A",
            "PREROUTING",
            "-i",
            out_interface,
            "-p",
            proto,
            "--dport",
            &external,
            "-j",
            "DNAT",
            "--to-destination",
            &destination,
        ])
        .await?;
        cmd::run(&[
            "iptables", "-A", "FORWARD", "-i", out_interface, "-p", proto, "--dport", &internal,
            "-d", target_ip, "-j", "ACCEPT",
        ])
        .await?;
        cmd::run(&[
            "iptables", "-A", "FORWARD", "-o", out_interface, "-p", proto, "--sport", &internal,
            "-s", target_ip, "-j", "ACCEPT",
        ])
        .await?;

        info!(
            out_interface,
            external_port, target_ip, target_port, proto, "published DNAT"
        );
        Ok(())
    }

    async fn unpublish_dnat(
        &self,
        out_interface: &str,
        external_port: u16,
        target_ip: &str,
        target_port: u16,
        proto: &str,
    ) -> Result<(), CmdError> {
        let external = external_port.to_string();
        let internal = target_port.to_string();
        let destination = format!("{target_ip}:{target_port}");

        self.iptables_delete(&[
            "iptables", "-D", "INPUT", "-i", out_interface, "-p", proto, "--dport", &external,
            "-j", "ACCEPT",
        ])
        .await?;
        self.iptables_delete(&[
            "iptables",
            "-t",
            "nat",
            "-D",
            "PREROUTING",
            "-i",
            out_interface,
            "-p",
            proto,
            "--dport",
            &external,
            "-j",
            "DNAT",
            "--to-destination",
            &destination,
        ])
        .await?;
        self.iptables_delete(&[
            "iptables", "-D", "FORWARD", "-i", out_interface, "-p", proto, "--dport", &internal,
            "-d", target_ip, "-j", "ACCEPT",
        ])
        .await?;
        self.iptables_delete(&[
            "iptables", "-D", "FORWARD", "-o", out_interface, "-p", proto, "--sport", &internal,
            "-s", target_ip, "-j", "ACCEPT",
        ])
        .await?;

        debug!(out_interface, external_port, "unpublished DNAT");
        Ok(())
    }

    async fn exec_in_namespace(&self, ns_name: &str, argv: &[&str]) -> Result<String, CmdError> {
        let mut full = vec!["ip", "netns", "exec", ns_name];
        full.extend_from_slice(argv);
        let out = cmd::run(&full).await?;
        Ok(out.stdout)
    }

    async fn ns_route_add(&self, ns_name: &str, iface: &str, cidr_list: &str) -> Result<(), CmdError> {
        for cidr in split_cidr_list(cidr_list) {
            let result = cmd::run(&[
                "ip", "netns", "exec", ns_name, "ip", "route", "add", cidr, "dev", iface,
            ])
            .await;
            match result {
                Ok(_) => debug!(namespace = ns_name, iface, cidr, "route added"),
                Err(err) if route_already_exists(&err) => {
                    debug!(namespace = ns_name, iface, cidr, "route already present");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn ns_route_del(&self, ns_name: &str, iface: &str, cidr_list: &str) -> Result<(), CmdError> {
        for cidr in split_cidr_list(cidr_list) {
            let result = cmd::run(&[
                "ip", "netns", "exec", ns_name, "ip", "route", "del", cidr, "dev", iface,
            ])
            .await;
            match result {
                Ok(_) => debug!(namespace = ns_name, iface, cidr, "route removed"),
                Err(err) if route_missing(&err) => {
                    debug!(namespace = ns_name, iface, cidr, "route already absent");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn ns_forward_allow(&self, ns_name: &str, cidr_list: &str) -> Result<(), CmdError> {
        for cidr in split_cidr_list(cidr_list) {
            cmd::run(&[
                "ip", "netns", "exec", ns_name, "iptables", "-A", "FORWARD", "-d", cidr, "-j",
                "ACCEPT",
            ])
            .await?;
            cmd::run(&[
                "ip", "netns", "exec", ns_name, "iptables", "-A", "FORWARD", "-s", cidr, "-j",
                "ACCEPT",
            ])
            .await?;
            debug!(namespace = ns_name, cidr, "forward rules added");
        }
        Ok(())
    }

    async fn ns_forward_disallow(&self, ns_name: &str, cidr_list: &str) -> Result<(), CmdError> {
        for cidr in split_cidr_list(cidr_list) {
            for direction in ["-d", "-s"] {
                let result = cmd::run(&[
                    "ip", "netns", "exec", ns_name, "iptables", "-D", "FORWARD", direction, cidr,
                    "-j", "ACCEPT",
                ])
                .await;
                if let Err(err) = result {
                    if !rule_missing(&err) {
                        warn!(namespace = ns_name, cidr, error = %err, "failed to delete forward rule");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("10.0.0.0/24", &["10.0.0.0/24"] ; "single entry")]
    #[test_case("10.0.0.0/24, 192.168.1.0/24", &["10.0.0.0/24", "192.168.1.0/24"] ; "two entries")]
    #[test_case(" 10.0.0.0/24 ,, ", &["10.0.0.0/24"] ; "empty entries dropped")]
    #[test_case("", &[] ; "empty list")]
    fn split_cidrs(list: &str, expected: &[&str]) {
        let got: Vec<&str> = split_cidr_list(list).collect();
        assert_eq!(got, expected);
    }

    fn failed(stderr: &str) -> CmdError {
        CmdError::Failed {
            cmd: "iptables".into(),
            status: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn route_error_classification() {
        assert!(route_already_exists(&failed("RTNETLINK answers: File exists")));
        assert!(route_missing(&failed("RTNETLINK answers: No such process")));
        assert!(!route_missing(&failed("RTNETLINK answers: Operation not permitted")));
    }

    #[test]
    fn rule_error_classification() {
        assert!(rule_missing(&failed("iptables: Bad rule (does a matching rule exist in that chain?).")));
        assert!(rule_missing(&failed("iptables: No chain/target/match by that name.")));
        assert!(!rule_missing(&failed("iptables: Permission denied (you must be root).")));
    }
}
