//! Media seam
//!
//! Capture, rendering and the actual peer connection live outside this
//! crate. These traits expose what the negotiation layer needs:
//! description/candidate plumbing on a per-peer media session, plus the
//! process-wide local capture source shared by every session.
//!
//! Media backends report ICE candidates and connection establishment as
//! events on a channel rather than ad hoc callbacks; the negotiation engine
//! is the single consumer.

pub mod mock;

#[cfg(feature = "webrtc-media")]
pub mod rtc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which half of the offer/answer handshake a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate descriptor, field names matching the browser JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Events a media session reports back to the negotiation engine
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A locally gathered candidate that should be signaled to the peer
    IceCandidate(IceCandidate),
    /// The media path is established
    Established,
    /// The session ended (failed, disconnected or closed)
    Closed,
}

/// Media subsystem errors
#[derive(Debug)]
pub enum MediaError {
    /// Local capture device unavailable
    Acquisition(String),
    /// SDP processing failed
    Sdp(String),
    /// ICE candidate processing failed
    Ice(String),
    /// Session creation failed
    SessionFailed(String),
    /// Operation on a closed session
    Closed,
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::Acquisition(msg) => write!(f, "Media acquisition failed: {}", msg),
            MediaError::Sdp(msg) => write!(f, "SDP error: {}", msg),
            MediaError::Ice(msg) => write!(f, "ICE error: {}", msg),
            MediaError::SessionFailed(msg) => write!(f, "Media session failed: {}", msg),
            MediaError::Closed => write!(f, "Media session is closed"),
        }
    }
}

impl Error for MediaError {}

/// One per-peer media session
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Whether a remote description has been applied yet; gates direct
    /// candidate application vs. buffering
    async fn has_remote_description(&self) -> bool;

    async fn close(&self) -> Result<(), MediaError>;
}

/// The process-wide local capture source.
///
/// Shared by all peer sessions; each session clones the same tracks.
/// Acquired lazily, released exactly once on media stop.
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn id(&self) -> String;

    /// Backend downcast hook (a backend recovers its own track bundle here)
    fn as_any(&self) -> &dyn std::any::Any;

    async fn stop(&self);
}

/// Creates media sources and sessions
#[async_trait]
pub trait MediaFactory: Send + Sync {
    /// Acquire the local capture source
    async fn acquire_source(&self) -> Result<Arc<dyn MediaSource>, MediaError>;

    /// Create a media session, attaching the local source's tracks when one
    /// is active. Returns the session plus its event stream.
    async fn create_session(
        &self,
        source: Option<Arc<dyn MediaSource>>,
    ) -> Result<(Arc<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), MediaError>;
}
