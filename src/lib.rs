//! Peercall - relay-routed WebRTC signaling core
//!
//! Coordinates WebRTC offer/answer/ICE negotiation between peers that can
//! only reach each other through a circuit relay. The transport stack and
//! the media subsystem are external collaborators behind trait seams.

pub mod client;
pub mod config;
pub mod media;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transport;

// Re-exports
pub use client::P2pClient;
pub use config::{ClientConfig, IceServerConfig};
pub use session::{NegotiationState, PeerSession, SessionRegistry};
pub use signaling::message::SignalingMessage;
pub use signaling::negotiation::NegotiationEngine;
pub use signaling::{SignalingError, SIGNALING_PROTOCOL};
