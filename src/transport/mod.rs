//! Transport seam
//!
//! The encrypted, multiplexed transport stack (relay circuits, peer
//! discovery, NAT traversal) lives outside this crate. These traits are the
//! interface it is expected to expose: dial, listen, per-protocol stream
//! handlers, and the active connection set.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Transport-level errors
#[derive(Debug)]
pub enum TransportError {
    /// Dial could not reach the target
    DialFailed(String),
    /// Stream open or I/O failed
    StreamFailed(String),
    /// Remote has no handler for the requested protocol
    ProtocolUnsupported(String),
    /// Node has been stopped
    NodeStopped,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::DialFailed(msg) => write!(f, "Dial failed: {}", msg),
            TransportError::StreamFailed(msg) => write!(f, "Stream failed: {}", msg),
            TransportError::ProtocolUnsupported(p) => write!(f, "Protocol not supported: {}", p),
            TransportError::NodeStopped => write!(f, "Transport node is stopped"),
        }
    }
}

impl Error for TransportError {}

/// One logical stream over a multiplexed connection.
///
/// Signaling uses one ephemeral stream per message: the sender writes a
/// single payload and closes; the receiver reads to end-of-stream.
#[async_trait]
pub trait RawStream: Send {
    /// Write the whole buffer
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read until the remote side closes its write half
    async fn read_to_end(&mut self) -> Result<Bytes, TransportError>;

    /// Close the local write half
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// An established connection to a remote peer
#[async_trait]
pub trait Connection: Send + Sync {
    /// Remote peer identity
    fn remote_peer(&self) -> String;

    /// Address this connection was established over
    fn remote_addr(&self) -> String;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Open a new outbound stream for the given protocol
    async fn open_stream(&self, protocol: &str) -> Result<Box<dyn RawStream>, TransportError>;

    /// Close the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// An inbound stream delivered to a protocol handler
pub struct InboundStream {
    /// Peer identity on the remote end of the carrying connection
    pub remote_peer: String,
    /// The stream itself
    pub stream: Box<dyn RawStream>,
}

/// Handler invoked for every inbound stream on a registered protocol.
///
/// Handlers run concurrently; two streams from the same peer may be in
/// flight at once.
pub type ProtocolHandler = Arc<dyn Fn(InboundStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// The transport node
#[async_trait]
pub trait Transport: Send + Sync {
    /// This node's peer identity
    fn local_peer_id(&self) -> String;

    /// Register a handler for inbound streams on `protocol`
    fn handle_protocol(&self, protocol: &str, handler: ProtocolHandler);

    /// Start listening on the given addresses
    async fn listen(&self, addrs: &[String]) -> Result<(), TransportError>;

    /// Dial an address, returning the established connection
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Connection>, TransportError>;

    /// Currently active connections
    async fn connections(&self) -> Vec<Arc<dyn Connection>>;

    /// Addresses this node is currently reachable on
    async fn local_addrs(&self) -> Vec<String>;

    /// Stop the node, closing all connections. Idempotent.
    async fn stop(&self) -> Result<(), TransportError>;
}
