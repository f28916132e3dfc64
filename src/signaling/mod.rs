//! Signaling coordination layer
//!
//! The offer/answer/ICE protocol exchanged over the relayed transport:
//! - message codec,
//! - per-message stream I/O,
//! - the per-peer negotiation state machine.

pub mod message;
pub mod negotiation;
pub mod stream;

use std::error::Error;
use std::fmt;

/// Protocol identifier the signaling exchange is carried on
pub const SIGNALING_PROTOCOL: &str = "/webrtc-signaling/1.0.0";

/// Signaling-layer errors
#[derive(Debug)]
pub enum SignalingError {
    /// Malformed signaling message; dropped locally, never fatal
    Decode(String),
    /// No active relay connection for a peer-to-peer dial
    NoRelayConnection,
    /// Transport-level dial failed
    Dial(String),
    /// Message referenced a peer with no session
    UnknownPeer(String),
    /// Local media device unavailable
    MediaAcquisition(String),
    /// Media session operation failed
    Media(String),
    /// Listener never obtained a WebRTC-capable address
    ListenerReadinessTimeout,
    /// Other transport failure
    Transport(String),
    /// Operation not valid in the current negotiation state
    InvalidState(String),
}

impl fmt::Display for SignalingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingError::Decode(msg) => write!(f, "Decode error: {}", msg),
            SignalingError::NoRelayConnection => write!(f, "Not connected to relay"),
            SignalingError::Dial(msg) => write!(f, "Dial failed: {}", msg),
            SignalingError::UnknownPeer(peer) => write!(f, "Unknown peer reference: {}", peer),
            SignalingError::MediaAcquisition(msg) => {
                write!(f, "Media acquisition failed: {}", msg)
            }
            SignalingError::Media(msg) => write!(f, "Media error: {}", msg),
            SignalingError::ListenerReadinessTimeout => {
                write!(f, "Timed out waiting for a WebRTC listen address")
            }
            SignalingError::Transport(msg) => write!(f, "Transport error: {}", msg),
            SignalingError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for SignalingError {}
