//! Peer address allocation inside a server's /24.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("invalid server address: {0:?}")]
    InvalidAddress(String),

    #[error("no free peer addresses in the server subnet")]
    SubnetExhausted,
}

/// Return the first unused host address in the server's /24, scanning
/// `.2 ..= .254` in ascending order. `.1` is the server, `.0` and `.255`
/// are never handed out.
pub fn allocate_peer_ip(server_address: &str, taken: &[&str]) -> Result<String, AllocError> {
    let invalid = || AllocError::InvalidAddress(server_address.to_owned());

    let (ip, prefix) = server_address.split_once('/').ok_or_else(invalid)?;
    let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix != 24 {
        return Err(invalid());
    }

    let [a, b, c, _] = ip.octets();
    let mut used: HashSet<Ipv4Addr> = taken.iter().filter_map(|s| s.parse().ok()).collect();
    used.insert(ip);

    (2..=254u8)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .find(|candidate| !used.contains(candidate))
        .map(|ip| ip.to_string())
        .ok_or(AllocError::SubnetExhausted)
}
