//! Transport trait and event types

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use fieldlink_core::TransportKind;
use tokio::sync::broadcast;

use super::TransportError;

/// Raw bytes read from the transport
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    /// Timestamp when the bytes were read
    pub timestamp: Instant,
    /// Bytes exactly as read; may hold a partial or several frames
    pub data: Bytes,
    /// Peer identity for server-style transports
    pub identity: Option<String>,
}

impl IncomingFrame {
    pub fn new(identity: Option<String>, data: impl Into<Bytes>) -> Self {
        Self {
            timestamp: Instant::now(),
            data: data.into(),
            identity,
        }
    }
}

/// Everything a transport reports to its channel
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Received(IncomingFrame),
    /// A server-style peer registered under this identity
    PeerConnected(String),
    /// A server-style peer went away
    PeerDisconnected(String),
    /// The transport itself was lost
    Disconnected(String),
}

/// Physical transport beneath a channel
///
/// Implementations publish everything they read through [`Transport::subscribe`];
/// they never interpret frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport shape, used to pick framing and lock scoping
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;

    /// Open the connection (or start listening for server-style transports)
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection; closing a closed transport is a no-op
    async fn close(&self) -> Result<(), TransportError>;

    /// Drop one peer's sub-connection on a server-style transport
    async fn close_peer(&self, _identity: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// Write one frame, addressed to `identity` on server-style transports
    async fn send(&self, identity: Option<&str>, frame: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to received frames and connection events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;
}
