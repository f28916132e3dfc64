//! Media backend over webrtc-rs
//!
//! Wraps `RTCPeerConnection` behind the [`MediaSession`] seam. Candidate
//! gathering and connection state changes are forwarded onto the session's
//! event channel for the negotiation engine to consume.

use super::{
    IceCandidate, MediaError, MediaEvent, MediaFactory, MediaSession, MediaSource, SdpKind,
    SessionDescription,
};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Media factory backed by webrtc-rs
pub struct RtcMediaFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcMediaFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Arc<Self> {
        Arc::new(Self { ice_servers })
    }
}

#[async_trait]
impl MediaFactory for RtcMediaFactory {
    async fn acquire_source(&self) -> Result<Arc<dyn MediaSource>, MediaError> {
        let video_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", uuid::Uuid::new_v4()),
            "peercall-media".to_string(),
        ));
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", uuid::Uuid::new_v4()),
            "peercall-media".to_string(),
        ));

        Ok(Arc::new(RtcMediaSource {
            id: format!("rtc-source-{}", uuid::Uuid::new_v4()),
            tracks: vec![video_track, audio_track],
            stopped: AtomicBool::new(false),
        }))
    }

    async fn create_session(
        &self,
        source: Option<Arc<dyn MediaSource>>,
    ) -> Result<(Arc<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::SessionFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            MediaError::SessionFailed(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api.new_peer_connection(rtc_config).await.map_err(|e| {
            MediaError::SessionFailed(format!("Failed to create peer connection: {}", e))
        })?;
        let peer_connection = Arc::new(peer_connection);

        // Attach the shared local tracks (sendonly), if media is active.
        if let Some(source) = source {
            if let Some(rtc_source) = source.as_any().downcast_ref::<RtcMediaSource>() {
                for track in &rtc_source.tracks {
                    let transceiver_init = RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: Vec::new(),
                    };
                    peer_connection
                        .add_transceiver_from_track(track.clone(), Some(transceiver_init))
                        .await
                        .map_err(|e| {
                            MediaError::SessionFailed(format!("Failed to add transceiver: {}", e))
                        })?;
                }
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ice_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let ice_tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = ice_tx.send(MediaEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
            })
        }));

        let state_tx = events_tx;
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                debug!("Peer connection state: {:?}", state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = state_tx.send(MediaEvent::Established);
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        let _ = state_tx.send(MediaEvent::Closed);
                    }
                    _ => {}
                }
            })
        }));

        let session = Arc::new(RtcMediaSession { peer_connection });
        Ok((session, events_rx))
    }
}

/// Local track bundle shared across sessions
pub struct RtcMediaSource {
    id: String,
    tracks: Vec<Arc<TrackLocalStaticRTP>>,
    stopped: AtomicBool,
}

impl RtcMediaSource {
    /// Tracks to feed captured RTP into
    pub fn tracks(&self) -> &[Arc<TrackLocalStaticRTP>] {
        &self.tracks
    }
}

#[async_trait]
impl MediaSource for RtcMediaSource {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

/// Media session over an `RTCPeerConnection`
pub struct RtcMediaSession {
    peer_connection: Arc<RTCPeerConnection>,
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone())
            .map_err(|e| MediaError::Sdp(format!("Invalid SDP offer: {}", e))),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone())
            .map_err(|e| MediaError::Sdp(format!("Invalid SDP answer: {}", e))),
    }
}

#[async_trait]
impl MediaSession for RtcMediaSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = to_rtc_description(&desc)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        let desc = to_rtc_description(&desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| MediaError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| MediaError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| MediaError::SessionFailed(format!("Close failed: {}", e)))
    }
}
