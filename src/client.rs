//! Client lifecycle
//!
//! Wires the transport, the media backend and the negotiation engine
//! together. Two roles: the listener initializes against a relay and waits
//! for a WebRTC-capable listen address; the dialer connects out to peers
//! through the relay circuit.

use crate::config::ClientConfig;
use crate::media::{MediaFactory, MediaSource};
use crate::relay;
use crate::session::SessionRegistry;
use crate::signaling::negotiation::NegotiationEngine;
use crate::signaling::{stream, SignalingError};
use crate::transport::{Connection, Transport};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Relay-routed signaling client
pub struct P2pClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    engine: Arc<NegotiationEngine>,
    registry: Arc<SessionRegistry>,
    /// Relay address recorded at initialization
    relay_addr: RwLock<Option<String>>,
    /// Peer id of the relay, known once dialed
    relay_peer: RwLock<Option<String>>,
    stopped: AtomicBool,
}

impl P2pClient {
    /// Build a client and register the inbound signaling handler
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        media_factory: Arc<dyn MediaFactory>,
    ) -> Arc<Self> {
        let registry = SessionRegistry::new();
        let engine = NegotiationEngine::new(transport.clone(), media_factory, registry.clone());
        stream::register_inbound_handler(transport.as_ref(), engine.clone());
        Arc::new(Self {
            config,
            transport,
            engine,
            registry,
            relay_addr: RwLock::new(None),
            relay_peer: RwLock::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_peer_id(&self) -> String {
        self.transport.local_peer_id()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn engine(&self) -> Arc<NegotiationEngine> {
        self.engine.clone()
    }

    /// Initialize the listener role: listen for relayed WebRTC traffic,
    /// connect to the relay, then wait (bounded) for a WebRTC-capable
    /// listen address to appear.
    pub async fn initialize_as_listener(&self, relay_addr: &str) -> Result<String, SignalingError> {
        self.transport
            .listen(&self.config.listen_addrs)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        *self.relay_addr.write() = Some(relay_addr.to_string());

        self.connect_relay(relay_addr).await?;
        self.wait_for_webrtc_addr().await?;

        let peer_id = self.local_peer_id();
        info!("Listener initialized as {}", peer_id);
        Ok(peer_id)
    }

    /// Initialize the dialer role. The relay is recorded but only dialed
    /// when the first peer connection needs it.
    pub fn initialize_as_dialer(&self, relay_addr: &str) -> String {
        *self.relay_addr.write() = Some(relay_addr.to_string());
        let peer_id = self.local_peer_id();
        info!("Dialer initialized as {}", peer_id);
        peer_id
    }

    /// Acquire local media ahead of connecting
    pub async fn start_media(&self) -> Result<Arc<dyn MediaSource>, SignalingError> {
        self.engine.start_media().await
    }

    /// Release local media
    pub async fn stop_media(&self) {
        self.engine.stop_media().await
    }

    /// Connect to `peer_id` through the relay circuit and, if local media
    /// is running, open the negotiation with an offer.
    pub async fn connect_to_peer(
        &self,
        peer_id: &str,
    ) -> Result<Arc<dyn Connection>, SignalingError> {
        let Some(relay_addr) = self.relay_addr.read().clone() else {
            return Err(SignalingError::NoRelayConnection);
        };
        if !self.relay_connected().await {
            debug!("No live relay connection, dialing {}", relay_addr);
            self.connect_relay(&relay_addr)
                .await
                .map_err(|_| SignalingError::NoRelayConnection)?;
        }

        let path = relay::resolve_relay_path(&relay_addr, peer_id);
        let connection = self.dial_with_timeout(&path).await?;
        info!("Connected to {} via relay", peer_id);

        if self.engine.has_local_media().await {
            self.engine.initiate(peer_id, connection.clone()).await?;
        } else {
            debug!("Local media not started, waiting for inbound negotiation");
        }
        Ok(connection)
    }

    /// Tear everything down: local media, all peer sessions, the transport.
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Client already disconnected");
            return;
        }
        self.engine.shutdown().await;
        *self.relay_peer.write() = None;
        if let Err(e) = self.transport.stop().await {
            warn!("Transport stop: {}", e);
        }
        info!("Client {} disconnected", self.local_peer_id());
    }

    async fn connect_relay(&self, relay_addr: &str) -> Result<(), SignalingError> {
        let connection = self.dial_with_timeout(relay_addr).await?;
        let relay_peer = connection.remote_peer();
        info!("Connected to relay {} at {}", relay_peer, relay_addr);
        *self.relay_peer.write() = Some(relay_peer);
        Ok(())
    }

    async fn relay_connected(&self) -> bool {
        let Some(relay_peer) = self.relay_peer.read().clone() else {
            return false;
        };
        self.transport
            .connections()
            .await
            .iter()
            .any(|c| c.remote_peer() == relay_peer && c.is_open())
    }

    async fn dial_with_timeout(&self, addr: &str) -> Result<Arc<dyn Connection>, SignalingError> {
        tokio::time::timeout(self.config.dial_timeout(), self.transport.dial(addr))
            .await
            .map_err(|_| SignalingError::Dial(format!("dial to {} timed out", addr)))?
            .map_err(|e| SignalingError::Dial(e.to_string()))
    }

    /// Poll local addresses until one advertises WebRTC reachability.
    /// Bounded: gives up after the configured number of checks.
    async fn wait_for_webrtc_addr(&self) -> Result<(), SignalingError> {
        for attempt in 1..=self.config.readiness_max_attempts {
            let addrs = self.transport.local_addrs().await;
            if addrs.iter().any(|a| a.contains("/webrtc")) {
                debug!("WebRTC listen address ready after {} checks", attempt);
                return Ok(());
            }
            // Sleep only between checks; the last failure reports at once.
            if attempt < self.config.readiness_max_attempts {
                tokio::time::sleep(self.config.readiness_poll_interval()).await;
            }
        }
        Err(SignalingError::ListenerReadinessTimeout)
    }
}
