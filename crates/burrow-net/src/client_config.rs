//! Renders the downloadable wg-quick config for a peer's device.

use std::fmt::Write as _;

use crate::catalog::{PeerRecord, ServerRecord};

/// Client-side config: full-tunnel by default, with an optional gateway
/// block (MASQUERADE out of `forward_interface`) when the peer is meant to
/// route for a LAN behind it. `%i` is left for wg-quick to substitute.
pub fn render_client_config(peer: &PeerRecord, server: &ServerRecord, server_ip: &str) -> String {
    let mut out = String::new();

    writeln!(out, "[Interface]").unwrap();
    writeln!(out, "PrivateKey = {}", peer.private_key).unwrap();
    writeln!(out, "Address = {}/32", peer.peer_address).unwrap();
    writeln!(out, "DNS = 1.1.1.1, 8.8.8.8").unwrap();

    if peer.enable_forwarding && !peer.forward_interface.is_empty() {
        let fwd = &peer.forward_interface;
        writeln!(
            out,
            "PostUp = iptables -t nat -A POSTROUTING -o {fwd} -j MASQUERADE; \
             iptables -A FORWARD -i %i -j ACCEPT; iptables -A FORWARD -o %i -j ACCEPT"
        )
        .unwrap();
        writeln!(
            out,
            "PreDown = iptables -t nat -D POSTROUTING -o {fwd} -j MASQUERADE; \
             iptables -D FORWARD -i %i -j ACCEPT; iptables -D FORWARD -o %i -j ACCEPT"
        )
        .unwrap();
    }

    writeln!(out).unwrap();
    writeln!(out, "[Peer]").unwrap();
    writeln!(out, "PublicKey = {}", server.wg_public_key).unwrap();
    writeln!(out, "Endpoint = {server_ip}:{}", server.wg_port).unwrap();
    writeln!(out, "AllowedIPs = 0.0.0.0/0, ::/0").unwrap();
    writeln!(out, "PersistentKeepalive = {}", peer.persistent_keepalive).unwrap();

    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn server() -> ServerRecord {
        ServerRecord {
            id: 1,
            user_id: 1,
            namespace: "wg_a1b2c3d4".into(),
            wg_interface: "wg0".into(),
            wg_port: 57401,
            wg_public_key: "SERVER_PUB".into(),
            wg_private_key: "SERVER_PRIV".into(),
            wg_address: "10.100.2.1/24".into(),
            enabled: true,
            download_rate: 0,
            upload_rate: 0,
            created_at: Utc::now(),
        }
    }

    fn peer() -> PeerRecord {
        PeerRecord {
            id: 7,
            server_id: 1,
            public_key: "PEER_PUB".into(),
            private_key: "PEER_PRIV".into(),
            peer_address: "10.100.2.2".into(),
            allowed_ips: "10.100.2.2/32".into(),
            persistent_keepalive: 25,
            comment: String::new(),
            enable_forwarding: false,
            forward_interface: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plain_client_config() {
        let text = render_client_config(&peer(), &server(), "203.0.113.10");

        assert!(text.contains("PrivateKey = PEER_PRIV"));
        assert!(text.contains("Address = 10.100.2.2/32"));
        assert!(text.contains("DNS = 1.1.1.1, 8.8.8.8"));
        assert!(text.contains("PublicKey = SERVER_PUB"));
        assert!(text.contains("Endpoint = 203.0.113.10:57401"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(!text.contains("PostUp"));
    }

    #[test]
    fn gateway_block_when_forwarding() {
        let mut p = peer();
        p.enable_forwarding = true;
        p.forward_interface = "eth0".into();

        let text = render_client_config(&p, &server(), "203.0.113.10");
        assert!(text.contains("PostUp = iptables -t nat -A POSTROUTING -o eth0 -j MASQUERADE"));
        assert!(text.contains("PreDown = iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE"));
        // wg-quick substitutes %i itself; it must reach the file intact.
        assert!(text.contains("-i %i -j ACCEPT"));
    }

    #[test]
    fn no_gateway_block_without_interface() {
        let mut p = peer();
        p.enable_forwarding = true; // interface left empty

        let text = render_client_config(&p, &server(), "203.0.113.10");
        assert!(!text.contains("PostUp"));
    }
}
