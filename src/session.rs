//! Peer session state and registry
//!
//! One [`PeerSession`] per remote peer identity, held in a concurrency-safe
//! registry. Creation is idempotent: concurrent callers for the same absent
//! id receive the same instance.

use crate::media::{IceCandidate, MediaSession};
use crate::signaling::message::SignalingMessage;
use crate::signaling::{stream, SignalingError};
use crate::transport::Connection;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// Negotiation state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No negotiation in flight
    Idle,
    /// We sent an offer and await the answer
    OfferSent,
    /// An inbound offer is being processed
    AwaitingAnswer,
    /// We replied to an inbound offer
    Answered,
    /// Media path established (or answer applied)
    Connected,
    /// Torn down; terminal
    Closed,
}

/// Per-peer session: transport connection, negotiation state, media session
pub struct PeerSession {
    /// Remote peer identity
    pub peer_id: String,
    connection: Arc<dyn Connection>,
    state: RwLock<NegotiationState>,
    media: RwLock<Option<Arc<dyn MediaSession>>>,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    send_lock: Mutex<()>,
    /// Serializes message application per session (receipt order)
    pub(crate) process_lock: Mutex<()>,
    created_at: Instant,
}

impl PeerSession {
    pub fn new(peer_id: String, connection: Arc<dyn Connection>) -> Self {
        Self {
            peer_id,
            connection,
            state: RwLock::new(NegotiationState::Idle),
            media: RwLock::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            send_lock: Mutex::new(()),
            process_lock: Mutex::new(()),
            created_at: Instant::now(),
        }
    }

    /// The transport connection this session signals over
    pub fn connection(&self) -> Arc<dyn Connection> {
        self.connection.clone()
    }

    /// Current negotiation state
    pub async fn state(&self) -> NegotiationState {
        *self.state.read().await
    }

    /// Update negotiation state. `Closed` is terminal: any attempt to leave
    /// it is ignored.
    pub async fn set_state(&self, state: NegotiationState) {
        let mut current = self.state.write().await;
        if *current == NegotiationState::Closed && state != NegotiationState::Closed {
            debug!(
                "Session {} is closed, ignoring transition to {:?}",
                self.peer_id, state
            );
            return;
        }
        if *current != state {
            debug!(
                "Session {} state change: {:?} -> {:?}",
                self.peer_id, *current, state
            );
            *current = state;
        }
    }

    /// The media session, if one has been created
    pub async fn media(&self) -> Option<Arc<dyn MediaSession>> {
        self.media.read().await.clone()
    }

    pub(crate) async fn set_media(&self, media: Arc<dyn MediaSession>) {
        *self.media.write().await = Some(media);
    }

    /// Drop the media session without closing the whole peer session (used
    /// when yielding a glared offer)
    pub(crate) async fn take_media(&self) -> Option<Arc<dyn MediaSession>> {
        self.media.write().await.take()
    }

    /// Buffer a candidate that arrived before the remote description
    pub(crate) async fn push_pending_candidate(&self, candidate: IceCandidate) {
        self.pending_candidates.lock().await.push(candidate);
    }

    /// Take the buffered candidates, in receipt order
    pub(crate) async fn drain_pending_candidates(&self) -> Vec<IceCandidate> {
        self.pending_candidates.lock().await.drain(..).collect()
    }

    /// Send a signaling message to this peer. Sends are serialized per
    /// session so consecutive messages cannot arrive out of causal order.
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        let _guard = self.send_lock.lock().await;
        stream::send_message(self.connection.as_ref(), message).await
    }

    /// Session age
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Tear the session down: close media and the transport connection
    pub async fn close(&self) {
        self.set_state(NegotiationState::Closed).await;

        if let Some(media) = self.take_media().await {
            if let Err(e) = media.close().await {
                debug!("Session {} media close: {}", self.peer_id, e);
            }
        }
        if let Err(e) = self.connection.close().await {
            debug!("Session {} connection close: {}", self.peer_id, e);
        }
        info!("Session {} closed after {:?}", self.peer_id, self.age());
    }
}

/// Concurrency-safe map of peer id to session
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the session for `peer_id`, creating it if absent. Atomic: a
    /// concurrent second caller receives the existing instance, never a
    /// replacement.
    pub async fn get_or_create(
        &self,
        peer_id: &str,
        connection: Arc<dyn Connection>,
    ) -> Arc<PeerSession> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(peer_id) {
            return existing.clone();
        }
        let session = Arc::new(PeerSession::new(peer_id.to_string(), connection));
        sessions.insert(peer_id.to_string(), session.clone());
        info!("Created peer session: {}", peer_id);
        session
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(peer_id).cloned()
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.write().await.remove(peer_id)
    }

    pub async fn all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Remove and return every session
    pub async fn clear(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.write().await.drain().map(|(_, s)| s).collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
