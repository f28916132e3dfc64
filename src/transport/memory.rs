//! In-process transport
//!
//! A network of in-memory nodes with relay-path routing and duplex
//! channel-backed streams. Backs the integration tests; dial addresses use
//! the same shapes as the real stack (`.../ws/p2p/<id>`,
//! `<relay>/p2p-circuit/webrtc/p2p/<id>`).

use super::{Connection, InboundStream, ProtocolHandler, RawStream, Transport, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A set of in-memory nodes that can dial each other
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    /// peer id -> node
    nodes: RwLock<HashMap<String, Arc<MemoryTransport>>>,
    /// externally dialable address -> peer id
    external_addrs: RwLock<HashMap<String, String>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node and register it with the network
    pub fn create_node(&self) -> Arc<MemoryTransport> {
        self.create_node_with_id(&format!("12D3Koo{}", uuid::Uuid::new_v4().simple()))
    }

    /// Create a node with a caller-chosen peer id (tests that depend on id
    /// ordering use this)
    pub fn create_node_with_id(&self, peer_id: &str) -> Arc<MemoryTransport> {
        let peer_id = peer_id.to_string();
        let node = Arc::new(MemoryTransport {
            peer_id: peer_id.clone(),
            network: self.clone(),
            handlers: RwLock::new(HashMap::new()),
            connections: RwLock::new(Vec::new()),
            listen_addrs: RwLock::new(Vec::new()),
            external_addrs: RwLock::new(Vec::new()),
            advertise_webrtc: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        self.inner.nodes.write().insert(peer_id, node.clone());
        node
    }

    fn node(&self, peer_id: &str) -> Option<Arc<MemoryTransport>> {
        self.inner.nodes.read().get(peer_id).cloned()
    }

    fn peer_for_addr(&self, addr: &str) -> Option<String> {
        self.inner.external_addrs.read().get(addr).cloned()
    }
}

/// One in-memory transport node
pub struct MemoryTransport {
    peer_id: String,
    network: MemoryNetwork,
    handlers: RwLock<HashMap<String, ProtocolHandler>>,
    connections: RwLock<Vec<Arc<MemoryConnection>>>,
    listen_addrs: RwLock<Vec<String>>,
    external_addrs: RwLock<Vec<String>>,
    advertise_webrtc: AtomicBool,
    stopped: AtomicBool,
}

impl MemoryTransport {
    /// Make this node dialable at `addr` (relay nodes use this)
    pub fn bind_external(&self, addr: &str) {
        self.network
            .inner
            .external_addrs
            .write()
            .insert(addr.to_string(), self.peer_id.clone());
        self.external_addrs.write().push(addr.to_string());
    }

    /// Test knob: suppress the synthesized `/webrtc` local address so
    /// listener readiness polling can be driven into its timeout path
    pub fn set_advertise_webrtc(&self, advertise: bool) {
        self.advertise_webrtc.store(advertise, Ordering::Relaxed);
    }

    /// Resolve a dial address to a target peer id
    fn resolve_target(&self, addr: &str) -> Result<String, TransportError> {
        if let Some(idx) = addr.find("/p2p-circuit") {
            // Circuit path: the prefix must be a known relay, the suffix
            // names the target peer.
            let relay_addr = &addr[..idx];
            if self.network.peer_for_addr(relay_addr).is_none() {
                return Err(TransportError::DialFailed(format!(
                    "no relay at {}",
                    relay_addr
                )));
            }
            return addr
                .rsplit("/p2p/")
                .next()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    TransportError::DialFailed(format!("no target peer in {}", addr))
                });
        }

        if let Some(peer) = self.network.peer_for_addr(addr) {
            return Ok(peer);
        }

        if let Some(peer) = addr.rsplit("/p2p/").next().filter(|s| *s != addr) {
            return Ok(peer.to_string());
        }

        Err(TransportError::DialFailed(format!(
            "unresolvable address {}",
            addr
        )))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    fn handle_protocol(&self, protocol: &str, handler: ProtocolHandler) {
        self.handlers.write().insert(protocol.to_string(), handler);
    }

    async fn listen(&self, addrs: &[String]) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(TransportError::NodeStopped);
        }
        self.listen_addrs.write().extend(addrs.iter().cloned());
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<Arc<dyn Connection>, TransportError> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(TransportError::NodeStopped);
        }
        let target_id = self.resolve_target(addr)?;
        if target_id == self.peer_id {
            return Err(TransportError::DialFailed("cannot dial self".to_string()));
        }
        let local = self
            .network
            .node(&self.peer_id)
            .ok_or(TransportError::NodeStopped)?;
        let target = self
            .network
            .node(&target_id)
            .ok_or_else(|| TransportError::DialFailed(format!("unknown peer {}", target_id)))?;

        let open = Arc::new(AtomicBool::new(true));
        let outbound = Arc::new(MemoryConnection {
            local_peer: self.peer_id.clone(),
            remote: target.clone(),
            remote_addr: addr.to_string(),
            open: open.clone(),
        });
        let inbound = Arc::new(MemoryConnection {
            local_peer: target_id.clone(),
            remote: local,
            remote_addr: format!("/memory/p2p/{}", self.peer_id),
            open,
        });
        self.connections.write().push(outbound.clone());
        target.connections.write().push(inbound);
        debug!("memory dial {} -> {} via {}", self.peer_id, target_id, addr);
        Ok(outbound)
    }

    async fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .read()
            .iter()
            .filter(|c| c.is_open())
            .map(|c| c.clone() as Arc<dyn Connection>)
            .collect()
    }

    async fn local_addrs(&self) -> Vec<String> {
        let mut addrs = self.external_addrs.read().clone();
        let listening_webrtc = self.listen_addrs.read().iter().any(|a| a == "/webrtc");
        if listening_webrtc && self.advertise_webrtc.load(Ordering::Relaxed) {
            addrs.push(format!("/memory/{}/webrtc", self.peer_id));
        }
        addrs
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        for conn in self.connections.write().drain(..) {
            conn.open.store(false, Ordering::Relaxed);
        }
        self.network.inner.nodes.write().remove(&self.peer_id);
        self.network
            .inner
            .external_addrs
            .write()
            .retain(|_, peer| peer != &self.peer_id);
        debug!("memory node {} stopped", self.peer_id);
        Ok(())
    }
}

/// One half of an in-memory connection pair
pub struct MemoryConnection {
    local_peer: String,
    remote: Arc<MemoryTransport>,
    remote_addr: String,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn remote_peer(&self) -> String {
        self.remote.peer_id.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn open_stream(&self, protocol: &str) -> Result<Box<dyn RawStream>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::StreamFailed("connection closed".to_string()));
        }
        let handler = self
            .remote
            .handlers
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| TransportError::ProtocolUnsupported(protocol.to_string()))?;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<Bytes>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<Bytes>();
        let local = MemoryStream {
            tx: Some(tx_out),
            rx: rx_in,
        };
        let remote_stream = MemoryStream {
            tx: Some(tx_in),
            rx: rx_out,
        };
        let inbound = InboundStream {
            remote_peer: self.local_peer.clone(),
            stream: Box::new(remote_stream),
        };
        tokio::spawn(handler(inbound));
        Ok(Box::new(local))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Channel-backed stream half
struct MemoryStream {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl RawStream for MemoryStream {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TransportError::StreamFailed("stream closed".to_string()))?;
        tx.send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::StreamFailed("remote hung up".to_string()))
    }

    async fn read_to_end(&mut self) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.rx.recv().await {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn dial_by_external_addr_and_stream_round_trip() {
        let network = MemoryNetwork::new();
        let server = network.create_node();
        let client = network.create_node();
        server.bind_external("/ip4/127.0.0.1/tcp/9090/ws");

        let (tx, mut rx) = unbounded_channel::<Vec<u8>>();
        server.handle_protocol(
            "/echo/1.0.0",
            Arc::new(move |mut inbound| {
                let tx = tx.clone();
                async move {
                    let payload = inbound.stream.read_to_end().await.unwrap();
                    let _ = tx.send(payload.to_vec());
                }
                .boxed()
            }),
        );

        let conn = client.dial("/ip4/127.0.0.1/tcp/9090/ws").await.unwrap();
        assert_eq!(conn.remote_peer(), server.local_peer_id());

        let mut stream = conn.open_stream("/echo/1.0.0").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn circuit_path_routes_to_target_peer() {
        let network = MemoryNetwork::new();
        let relay = network.create_node();
        let listener = network.create_node();
        let dialer = network.create_node();
        relay.bind_external("/ip4/127.0.0.1/tcp/9090/ws");

        let addr = format!(
            "/ip4/127.0.0.1/tcp/9090/ws/p2p-circuit/webrtc/p2p/{}",
            listener.local_peer_id()
        );
        let conn = dialer.dial(&addr).await.unwrap();
        assert_eq!(conn.remote_peer(), listener.local_peer_id());
        // Both ends see the connection.
        assert_eq!(listener.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn circuit_path_through_unknown_relay_fails() {
        let network = MemoryNetwork::new();
        let dialer = network.create_node();
        let Err(err) = dialer
            .dial("/ip4/10.0.0.1/tcp/1/ws/p2p-circuit/webrtc/p2p/nobody")
            .await
        else {
            panic!("dial through an unknown relay should fail");
        };
        assert!(matches!(err, TransportError::DialFailed(_)));
    }

    #[tokio::test]
    async fn open_stream_without_handler_is_rejected() {
        let network = MemoryNetwork::new();
        let a = network.create_node();
        let b = network.create_node();
        let conn = a
            .dial(&format!("/memory/p2p/{}", b.local_peer_id()))
            .await
            .unwrap();
        let Err(err) = conn.open_stream("/nope/1.0.0").await else {
            panic!("unhandled protocol should be rejected");
        };
        assert!(matches!(err, TransportError::ProtocolUnsupported(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_connections() {
        let network = MemoryNetwork::new();
        let a = network.create_node();
        let b = network.create_node();
        let conn = a
            .dial(&format!("/memory/p2p/{}", b.local_peer_id()))
            .await
            .unwrap();

        a.stop().await.unwrap();
        a.stop().await.unwrap();
        assert!(!conn.is_open());
        assert!(a.connections().await.is_empty());
    }

    #[tokio::test]
    async fn webrtc_addr_advertised_only_when_listening() {
        let network = MemoryNetwork::new();
        let node = network.create_node();
        assert!(node.local_addrs().await.is_empty());

        node.listen(&["/p2p-circuit".to_string(), "/webrtc".to_string()])
            .await
            .unwrap();
        assert!(node.local_addrs().await.iter().any(|a| a.contains("/webrtc")));

        node.set_advertise_webrtc(false);
        assert!(node.local_addrs().await.is_empty());
    }
}
