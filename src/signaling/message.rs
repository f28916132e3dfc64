//! Signaling wire messages
//!
//! One JSON object per stream: `{"type": "offer"|"answer"|"ice-candidate",
//! "sdp"?: ..., "candidate"?: ...}`. Constructed once, serialized once.

use super::SignalingError;
use crate::media::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// Signaling message kinds exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// SDP offer opening a negotiation
    Offer { sdp: SessionDescription },

    /// SDP answer to a received offer
    Answer { sdp: SessionDescription },

    /// A gathered ICE candidate
    IceCandidate { candidate: IceCandidate },
}

impl SignalingMessage {
    pub fn offer(sdp: SessionDescription) -> Self {
        SignalingMessage::Offer { sdp }
    }

    pub fn answer(sdp: SessionDescription) -> Self {
        SignalingMessage::Answer { sdp }
    }

    pub fn ice_candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::IceCandidate { candidate }
    }

    /// Wire tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Serialize for transmission
    pub fn encode(&self) -> Result<Vec<u8>, SignalingError> {
        serde_json::to_vec(self)
            .map_err(|e| SignalingError::Decode(format!("Failed to serialize message: {}", e)))
    }

    /// Parse a received payload
    pub fn decode(payload: &[u8]) -> Result<Self, SignalingError> {
        serde_json::from_slice(payload)
            .map_err(|e| SignalingError::Decode(format!("Invalid signaling message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SdpKind;

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn round_trip_all_kinds() {
        let messages = vec![
            SignalingMessage::offer(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0")),
            SignalingMessage::answer(SessionDescription::answer("v=0\r\no=- 2 2 IN IP4 0.0.0.0")),
            SignalingMessage::ice_candidate(candidate()),
        ];
        for message in messages {
            let decoded = SignalingMessage::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn wire_format_matches_browser_json() {
        let json = r#"{"type":"offer","sdp":{"type":"offer","sdp":"v=0"}}"#;
        let message = SignalingMessage::decode(json.as_bytes()).unwrap();
        match message {
            SignalingMessage::Offer { sdp } => {
                assert_eq!(sdp.kind, SdpKind::Offer);
                assert_eq!(sdp.sdp, "v=0");
            }
            _ => panic!("Expected Offer"),
        }

        let json = r#"{"type":"ice-candidate","candidate":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}"#;
        let message = SignalingMessage::decode(json.as_bytes()).unwrap();
        match message {
            SignalingMessage::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            _ => panic!("Expected IceCandidate"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = SignalingMessage::decode(br#"{"type":"renegotiate"}"#).unwrap_err();
        assert!(matches!(err, SignalingError::Decode(_)));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(SignalingMessage::decode(b"not json").is_err());
        assert!(SignalingMessage::decode(b"").is_err());
    }
}
