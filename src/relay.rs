//! Relay dial-path construction
//!
//! All peer-to-peer dials are routed through a circuit relay. The relay is
//! identified by its peer id once connected; the dial path for a target is
//! the relay address extended with a circuit hop.

/// Default TCP port a relay's WebSocket listener runs on
pub const DEFAULT_RELAY_PORT: u16 = 9090;

/// Listen address shape used by a relay on `port`
pub fn relay_listen_addr(port: u16) -> String {
    format!("/ip4/0.0.0.0/tcp/{}/ws", port)
}

/// Dial path for `target_peer` routed through the relay at `relay_addr`
pub fn resolve_relay_path(relay_addr: &str, target_peer: &str) -> String {
    format!(
        "{}/p2p-circuit/webrtc/p2p/{}",
        relay_addr.trim_end_matches('/'),
        target_peer
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_path_has_circuit_and_webrtc_hops() {
        let path = resolve_relay_path("/ip4/127.0.0.1/tcp/9090/ws", "12D3KooTarget");
        assert_eq!(
            path,
            "/ip4/127.0.0.1/tcp/9090/ws/p2p-circuit/webrtc/p2p/12D3KooTarget"
        );
    }

    #[test]
    fn trailing_slash_on_relay_addr_is_tolerated() {
        let path = resolve_relay_path("/ip4/127.0.0.1/tcp/9090/ws/", "peer");
        assert_eq!(path, "/ip4/127.0.0.1/tcp/9090/ws/p2p-circuit/webrtc/p2p/peer");
    }

    #[test]
    fn listen_addr_uses_port() {
        assert_eq!(relay_listen_addr(9090), "/ip4/0.0.0.0/tcp/9090/ws");
        assert_eq!(relay_listen_addr(4001), "/ip4/0.0.0.0/tcp/4001/ws");
    }
}
