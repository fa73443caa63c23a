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

//! Privileged networking core for burrow: one Linux network namespace per
//! user, a veth uplink to the host, a WireGuard server inside the namespace,
//! and host DNAT publishing its UDP port. All kernel state is mediated by
//! forked `ip` / `iptables` / `sysctl` / `wg` / `wg-quick` processes; the
//! process needs CAP_NET_ADMIN (or root) and those binaries on PATH.

pub mod alloc;
pub mod catalog;
pub mod client_config;
pub mod cmd;
pub mod netns;
pub mod peers;
pub mod provision;
pub mod wireguard;

pub use cmd::CmdError;
pub use netns::{HostNet, SysHostNet};
pub use provision::{derive, DerivedNet, NetworkConfig, ProvisionError, Provisioner};
pub use wireguard::{SysWg, WgRuntime};
