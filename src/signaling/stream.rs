//! Signaling stream I/O
//!
//! One ephemeral stream per outbound message; a long-lived protocol handler
//! for inbound streams. Malformed payloads are logged and dropped so a bad
//! message never takes the handler down.

use super::message::SignalingMessage;
use super::negotiation::NegotiationEngine;
use super::{SignalingError, SIGNALING_PROTOCOL};
use crate::transport::{Connection, InboundStream, ProtocolHandler, Transport};
use log::{debug, warn};
use std::sync::Arc;

/// Send one message over a fresh stream on the signaling protocol
pub async fn send_message(
    connection: &dyn Connection,
    message: &SignalingMessage,
) -> Result<(), SignalingError> {
    let payload = message.encode()?;
    let mut stream = connection
        .open_stream(SIGNALING_PROTOCOL)
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))?;
    stream
        .close()
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))?;
    debug!("Sent {} to {}", message.kind(), connection.remote_peer());
    Ok(())
}

/// Register the inbound signaling handler on the transport.
///
/// Every inbound stream carries exactly one message; streams from different
/// peers (and multiple streams from one peer) are handled concurrently.
pub fn register_inbound_handler(transport: &dyn Transport, engine: Arc<NegotiationEngine>) {
    let handler: ProtocolHandler = Arc::new(move |inbound: InboundStream| {
        let engine = engine.clone();
        Box::pin(async move {
            let InboundStream {
                remote_peer,
                mut stream,
            } = inbound;

            let payload = match stream.read_to_end().await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Signaling stream read from {} failed: {}", remote_peer, e);
                    return;
                }
            };

            match SignalingMessage::decode(&payload) {
                Ok(message) => {
                    debug!("Received {} from {}", message.kind(), remote_peer);
                    engine.handle_message(&remote_peer, message).await;
                }
                Err(e) => {
                    // Drop the single malformed message; later streams keep
                    // being served.
                    warn!("Dropping malformed signaling message from {}: {}", remote_peer, e);
                }
            }
        })
    });
    transport.handle_protocol(SIGNALING_PROTOCOL, handler);
}
