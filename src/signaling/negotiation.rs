//! Per-peer negotiation state machine
//!
//! Single consumer for everything that drives a negotiation forward:
//! inbound signaling messages, local connect intent, and media events
//! (gathered candidates, establishment). Message application is serialized
//! per session; protocol anomalies are absorbed here and never escalate
//! past the stream handler.

use super::message::SignalingMessage;
use super::SignalingError;
use crate::media::{
    IceCandidate, MediaError, MediaEvent, MediaFactory, MediaSession, MediaSource,
    SessionDescription,
};
use crate::session::{NegotiationState, PeerSession, SessionRegistry};
use crate::transport::{Connection, Transport};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Drives offer/answer/ICE handling for every peer session
pub struct NegotiationEngine {
    local_peer_id: String,
    transport: Arc<dyn Transport>,
    media_factory: Arc<dyn MediaFactory>,
    registry: Arc<SessionRegistry>,
    /// Process-wide local capture source, shared by all sessions
    local_source: RwLock<Option<Arc<dyn MediaSource>>>,
}

impl NegotiationEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        media_factory: Arc<dyn MediaFactory>,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer_id: transport.local_peer_id(),
            transport,
            media_factory,
            registry,
            local_source: RwLock::new(None),
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Acquire the local capture source (idempotent)
    pub async fn start_media(&self) -> Result<Arc<dyn MediaSource>, SignalingError> {
        let mut guard = self.local_source.write().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }
        let source = self
            .media_factory
            .acquire_source()
            .await
            .map_err(|e| match e {
                MediaError::Acquisition(msg) => SignalingError::MediaAcquisition(msg),
                other => SignalingError::MediaAcquisition(other.to_string()),
            })?;
        info!("Local media started: {}", source.id());
        *guard = Some(source.clone());
        Ok(source)
    }

    /// Release the local capture source (released exactly once)
    pub async fn stop_media(&self) {
        if let Some(source) = self.local_source.write().await.take() {
            source.stop().await;
            info!("Local media stopped: {}", source.id());
        }
    }

    pub async fn has_local_media(&self) -> bool {
        self.local_source.read().await.is_some()
    }

    async fn local_source(&self) -> Option<Arc<dyn MediaSource>> {
        self.local_source.read().await.clone()
    }

    /// Entry point for every inbound signaling message
    pub async fn handle_message(&self, remote_peer: &str, message: SignalingMessage) {
        // First signaling activity starts local media lazily.
        self.ensure_local_media().await;

        match message {
            SignalingMessage::Offer { sdp } => self.handle_offer(remote_peer, sdp).await,
            SignalingMessage::Answer { sdp } => self.handle_answer(remote_peer, sdp).await,
            SignalingMessage::IceCandidate { candidate } => {
                self.handle_candidate(remote_peer, candidate).await
            }
        }
    }

    /// Start an outbound negotiation: create the session, send one offer.
    ///
    /// A negotiation already in flight for this peer is left untouched;
    /// a closed session refuses new negotiation.
    pub async fn initiate(
        &self,
        peer_id: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<(), SignalingError> {
        if self.local_source().await.is_none() {
            return Err(SignalingError::InvalidState(
                "local media not started".to_string(),
            ));
        }

        let session = self.registry.get_or_create(peer_id, connection).await;
        let _guard = session.process_lock.lock().await;

        match session.state().await {
            NegotiationState::Idle => {}
            NegotiationState::Closed => {
                return Err(SignalingError::InvalidState(format!(
                    "session to {} is closed",
                    peer_id
                )));
            }
            other => {
                debug!("Negotiation with {} already in flight ({:?})", peer_id, other);
                return Ok(());
            }
        }

        let media = self.ensure_media(&session).await?;
        let offer = media
            .create_offer()
            .await
            .map_err(|e| SignalingError::Media(e.to_string()))?;
        media
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SignalingError::Media(e.to_string()))?;
        session.send(&SignalingMessage::offer(offer)).await?;
        session.set_state(NegotiationState::OfferSent).await;
        info!("Sent offer to {}", peer_id);
        Ok(())
    }

    async fn handle_offer(&self, remote_peer: &str, sdp: SessionDescription) {
        let Some(connection) = self.connection_to(remote_peer).await else {
            warn!("Offer from {} without a transport connection, dropping", remote_peer);
            return;
        };
        let session = self.registry.get_or_create(remote_peer, connection).await;
        let _guard = session.process_lock.lock().await;

        match session.state().await {
            NegotiationState::Idle => {}
            NegotiationState::OfferSent => {
                // Glare: both sides sent offers. The offer from the
                // lexicographically smaller peer id is authoritative.
                if self.local_peer_id.as_str() < remote_peer {
                    warn!(
                        "Offer glare with {}: our offer wins, dropping theirs",
                        remote_peer
                    );
                    return;
                }
                warn!("Offer glare with {}: yielding to their offer", remote_peer);
                if let Some(media) = session.take_media().await {
                    let _ = media.close().await;
                }
                session.set_state(NegotiationState::Idle).await;
            }
            NegotiationState::Closed => {
                debug!("Offer from {} for a closed session, dropping", remote_peer);
                return;
            }
            other => {
                warn!("Offer from {} in state {:?}, dropping", remote_peer, other);
                return;
            }
        }

        session.set_state(NegotiationState::AwaitingAnswer).await;

        let media = match self.ensure_media(&session).await {
            Ok(media) => media,
            Err(e) => {
                warn!("No media session for {}: {}", remote_peer, e);
                session.set_state(NegotiationState::Idle).await;
                return;
            }
        };

        if let Err(e) = media.set_remote_description(sdp).await {
            warn!("Offer from {} rejected: {}", remote_peer, e);
            session.set_state(NegotiationState::Idle).await;
            return;
        }
        self.flush_pending_candidates(&session, &media).await;

        let answer = match media.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to create answer for {}: {}", remote_peer, e);
                session.set_state(NegotiationState::Idle).await;
                return;
            }
        };
        if let Err(e) = media.set_local_description(answer.clone()).await {
            warn!("Failed to apply local answer for {}: {}", remote_peer, e);
            session.set_state(NegotiationState::Idle).await;
            return;
        }
        if let Err(e) = session.send(&SignalingMessage::answer(answer)).await {
            warn!("Failed to send answer to {}: {}", remote_peer, e);
            return;
        }
        session.set_state(NegotiationState::Answered).await;
        info!("Answered offer from {}", remote_peer);
    }

    async fn handle_answer(&self, remote_peer: &str, sdp: SessionDescription) {
        // Unknown peer references are dropped, never escalated.
        let Some(session) = self.registry.get(remote_peer).await else {
            warn!("Answer from {} with no peer session, dropping", remote_peer);
            return;
        };
        let _guard = session.process_lock.lock().await;

        match session.state().await {
            NegotiationState::OfferSent => {}
            NegotiationState::Closed => {
                debug!("Answer from {} for a closed session, dropping", remote_peer);
                return;
            }
            other => {
                warn!("Answer from {} in state {:?}, dropping", remote_peer, other);
                return;
            }
        }

        let Some(media) = session.media().await else {
            warn!("Answer from {} but no media session, dropping", remote_peer);
            return;
        };
        if let Err(e) = media.set_remote_description(sdp).await {
            warn!("Answer from {} rejected: {}", remote_peer, e);
            return;
        }
        self.flush_pending_candidates(&session, &media).await;
        session.set_state(NegotiationState::Connected).await;
        info!("Answer from {} applied", remote_peer);
    }

    async fn handle_candidate(&self, remote_peer: &str, candidate: IceCandidate) {
        let Some(session) = self.registry.get(remote_peer).await else {
            warn!("Candidate from {} with no peer session, dropping", remote_peer);
            return;
        };
        let _guard = session.process_lock.lock().await;

        if session.state().await == NegotiationState::Closed {
            debug!("Candidate from {} for a closed session, dropping", remote_peer);
            return;
        }

        let media = session.media().await;
        match media {
            Some(media) if media.has_remote_description().await => {
                if let Err(e) = media.add_ice_candidate(candidate).await {
                    warn!("Candidate from {} rejected: {}", remote_peer, e);
                }
            }
            _ => {
                // No remote description yet: buffer and apply once it lands.
                debug!("Buffering early candidate from {}", remote_peer);
                session.push_pending_candidate(candidate).await;
            }
        }
    }

    /// Close every session. The registry ends up empty.
    pub async fn shutdown(&self) {
        self.stop_media().await;
        for session in self.registry.clear().await {
            session.close().await;
        }
    }

    async fn ensure_local_media(&self) {
        if !self.has_local_media().await {
            if let Err(e) = self.start_media().await {
                warn!("Failed to start local media: {}", e);
            }
        }
    }

    async fn ensure_media(
        &self,
        session: &Arc<PeerSession>,
    ) -> Result<Arc<dyn MediaSession>, SignalingError> {
        if let Some(existing) = session.media().await {
            return Ok(existing);
        }
        let source = self.local_source().await;
        let (media, events) = self
            .media_factory
            .create_session(source)
            .await
            .map_err(|e| SignalingError::Media(e.to_string()))?;
        session.set_media(media.clone()).await;
        Self::spawn_event_pump(session.clone(), media.clone(), self.registry.clone(), events);
        Ok(media)
    }

    async fn flush_pending_candidates(
        &self,
        session: &Arc<PeerSession>,
        media: &Arc<dyn MediaSession>,
    ) {
        let pending = session.drain_pending_candidates().await;
        if pending.is_empty() {
            return;
        }
        debug!(
            "Applying {} buffered candidates for {}",
            pending.len(),
            session.peer_id
        );
        for candidate in pending {
            if let Err(e) = media.add_ice_candidate(candidate).await {
                warn!("Buffered candidate for {} rejected: {}", session.peer_id, e);
            }
        }
    }

    async fn connection_to(&self, remote_peer: &str) -> Option<Arc<dyn Connection>> {
        self.transport
            .connections()
            .await
            .into_iter()
            .find(|c| c.remote_peer() == remote_peer && c.is_open())
    }

    /// Forward media events into the state machine: gathered candidates go
    /// out as signaling messages, establishment and closure update state.
    ///
    /// The pump is tied to the media instance it was spawned for. When the
    /// session has moved on to a replacement (glare yield), the old media's
    /// `Closed` only ends the old pump; it must not touch the session.
    fn spawn_event_pump(
        session: Arc<PeerSession>,
        media: Arc<dyn MediaSession>,
        registry: Arc<SessionRegistry>,
        mut events: mpsc::UnboundedReceiver<MediaEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MediaEvent::IceCandidate(candidate) => {
                        if session.state().await == NegotiationState::Closed {
                            break;
                        }
                        if let Err(e) = session
                            .send(&SignalingMessage::ice_candidate(candidate))
                            .await
                        {
                            warn!("Failed to send candidate to {}: {}", session.peer_id, e);
                        }
                    }
                    MediaEvent::Established => {
                        if session.state().await == NegotiationState::Answered {
                            session.set_state(NegotiationState::Connected).await;
                            info!("Media established with {}", session.peer_id);
                        }
                    }
                    MediaEvent::Closed => {
                        let replaced = match session.media().await {
                            Some(current) => !Arc::ptr_eq(&current, &media),
                            None => true,
                        };
                        if !replaced && session.state().await != NegotiationState::Closed {
                            debug!("Media session with {} ended", session.peer_id);
                            registry.remove(&session.peer_id).await;
                            session.close().await;
                        }
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockMediaFactory;
    use crate::signaling::SIGNALING_PROTOCOL;
    use crate::transport::memory::{MemoryNetwork, MemoryTransport};
    use crate::transport::InboundStream;
    use futures::FutureExt;

    struct Endpoint {
        transport: Arc<MemoryTransport>,
        media: Arc<MockMediaFactory>,
        engine: Arc<NegotiationEngine>,
    }

    /// Engine under test with a signaling sink: messages the engine sends
    /// are accepted and discarded, so the remote side is driven manually
    /// through `handle_message`.
    fn endpoint(network: &MemoryNetwork, peer_id: &str) -> Endpoint {
        let transport = network.create_node_with_id(peer_id);
        transport.handle_protocol(
            SIGNALING_PROTOCOL,
            Arc::new(|mut inbound: InboundStream| {
                async move {
                    let _ = inbound.stream.read_to_end().await;
                }
                .boxed()
            }),
        );
        let media = MockMediaFactory::new();
        let engine = NegotiationEngine::new(
            transport.clone(),
            media.clone(),
            SessionRegistry::new(),
        );
        Endpoint {
            transport,
            media,
            engine,
        }
    }

    #[tokio::test]
    async fn early_candidates_buffer_and_flush_in_order() {
        let network = MemoryNetwork::new();
        let a = endpoint(&network, "peerA");
        let b = endpoint(&network, "peerB");

        a.engine.start_media().await.unwrap();
        let conn = a
            .transport
            .dial(&format!("/memory/p2p/{}", b.transport.local_peer_id()))
            .await
            .unwrap();
        a.engine.initiate("peerB", conn).await.unwrap();

        let first = IceCandidate {
            candidate: "candidate:first".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let second = IceCandidate {
            candidate: "candidate:second".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        a.engine
            .handle_message("peerB", SignalingMessage::ice_candidate(first.clone()))
            .await;
        a.engine
            .handle_message("peerB", SignalingMessage::ice_candidate(second.clone()))
            .await;

        let media = a.media.sessions()[0].clone();
        assert!(media.applied_candidates().is_empty());

        a.engine
            .handle_message(
                "peerB",
                SignalingMessage::answer(SessionDescription::answer("v=0 answer")),
            )
            .await;

        let applied = media.applied_candidates();
        assert_eq!(applied, vec![first, second]);
        let session = a.engine.registry().get("peerB").await.unwrap();
        assert_eq!(session.state().await, NegotiationState::Connected);
    }

    #[tokio::test]
    async fn glare_smaller_peer_id_wins() {
        let network = MemoryNetwork::new();
        let a = endpoint(&network, "peerA");
        let b = endpoint(&network, "peerB");

        a.engine.start_media().await.unwrap();
        b.engine.start_media().await.unwrap();

        // One dial gives both sides a connection to the other.
        let conn_ab = a
            .transport
            .dial(&format!("/memory/p2p/{}", b.transport.local_peer_id()))
            .await
            .unwrap();
        let conn_ba = b
            .transport
            .connections()
            .await
            .into_iter()
            .find(|c| c.remote_peer() == "peerA")
            .unwrap();

        // Both sides just sent an offer; neither has seen the other's yet.
        let session_a = a.engine.registry().get_or_create("peerB", conn_ab).await;
        session_a.set_state(NegotiationState::OfferSent).await;
        let session_b = b.engine.registry().get_or_create("peerA", conn_ba).await;
        session_b.set_state(NegotiationState::OfferSent).await;

        // peerA < peerB, so A keeps its offer and drops B's...
        a.engine
            .handle_message(
                "peerB",
                SignalingMessage::offer(SessionDescription::offer("v=0 glare-offer")),
            )
            .await;
        assert_eq!(session_a.state().await, NegotiationState::OfferSent);

        // ...while B yields and answers A's offer.
        b.engine
            .handle_message(
                "peerA",
                SignalingMessage::offer(SessionDescription::offer("v=0 glare-offer")),
            )
            .await;
        let session_b = b.engine.registry().get("peerA").await.unwrap();
        assert_eq!(session_b.state().await, NegotiationState::Answered);
    }

    #[tokio::test]
    async fn glare_loser_survives_yielding_its_offer() {
        let network = MemoryNetwork::new();
        let a = endpoint(&network, "peerA");
        let b = endpoint(&network, "peerB");

        a.engine.start_media().await.unwrap();
        b.engine.start_media().await.unwrap();

        // Crossing offers, both through the real initiate path so each
        // side has a live media session and event pump.
        let conn_ab = a
            .transport
            .dial(&format!("/memory/p2p/{}", b.transport.local_peer_id()))
            .await
            .unwrap();
        a.engine.initiate("peerB", conn_ab).await.unwrap();
        let conn_ba = b
            .transport
            .connections()
            .await
            .into_iter()
            .find(|c| c.remote_peer() == "peerA")
            .unwrap();
        b.engine.initiate("peerA", conn_ba).await.unwrap();

        // B loses the tie-break: abandons its own offer and answers A's.
        b.engine
            .handle_message(
                "peerA",
                SignalingMessage::offer(SessionDescription::offer("v=0 crossing-offer")),
            )
            .await;
        let session_b = b.engine.registry().get("peerA").await.unwrap();
        assert_eq!(session_b.state().await, NegotiationState::Answered);

        // The abandoned media session shuts down asynchronously; that must
        // not take the peer session or its replacement with it.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let session_b = b
            .engine
            .registry()
            .get("peerA")
            .await
            .expect("session survives the stale media shutdown");
        assert_eq!(session_b.state().await, NegotiationState::Answered);
        assert!(session_b.connection().is_open());
        let sessions = b.media.sessions();
        assert!(sessions[0].is_closed());
        assert!(!sessions[1].is_closed());
    }

    #[tokio::test]
    async fn answer_for_unknown_peer_is_dropped() {
        let network = MemoryNetwork::new();
        let a = endpoint(&network, "peerA");
        a.engine
            .handle_message(
                "ghost",
                SignalingMessage::answer(SessionDescription::answer("v=0")),
            )
            .await;
        assert!(a.engine.registry().is_empty().await);
    }

    #[tokio::test]
    async fn initiate_without_media_is_invalid() {
        let network = MemoryNetwork::new();
        let a = endpoint(&network, "peerA");
        let b = endpoint(&network, "peerB");
        let conn = a
            .transport
            .dial(&format!("/memory/p2p/{}", b.transport.local_peer_id()))
            .await
            .unwrap();
        let err = a.engine.initiate("peerB", conn).await.unwrap_err();
        assert!(matches!(err, SignalingError::InvalidState(_)));
        assert!(a.engine.registry().is_empty().await);
    }

    #[tokio::test]
    async fn second_initiate_is_a_no_op() {
        let network = MemoryNetwork::new();
        let a = endpoint(&network, "peerA");
        let b = endpoint(&network, "peerB");
        a.engine.start_media().await.unwrap();
        let conn = a
            .transport
            .dial(&format!("/memory/p2p/{}", b.transport.local_peer_id()))
            .await
            .unwrap();
        a.engine.initiate("peerB", conn.clone()).await.unwrap();
        a.engine.initiate("peerB", conn).await.unwrap();
        // Exactly one media session, exactly one negotiation.
        assert_eq!(a.media.sessions().len(), 1);
    }
}
