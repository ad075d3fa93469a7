//! Message types exchanged between devices, adapters and channels

use std::fmt;

use bytes::Bytes;

/// Opaque correlation identifier tying a request to its response
///
/// Only unique among requests outstanding on one endpoint at a time; values
/// are reused once a request resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sign(pub u32);

impl Sign {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Sign {
    fn from(value: u32) -> Self {
        Sign(value)
    }
}

/// Physical shape of a transport, used to pick a framing adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Point-to-point byte stream (TCP client)
    Stream,
    /// Datagram socket (UDP)
    Datagram,
    /// Serial line
    Serial,
    /// Server accepting many identified peers (DTU service)
    Server,
}

impl TransportKind {
    /// Whether one transport hosts several independently addressed identities
    pub fn is_multi_identity(self) -> bool {
        matches!(self, TransportKind::Server)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Stream => "stream",
            TransportKind::Datagram => "datagram",
            TransportKind::Serial => "serial",
            TransportKind::Server => "server",
        };
        f.write_str(name)
    }
}

/// Request payload handed to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Protocol payload without framing
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Correlation sign recovered from the frame, if the protocol carries one
    pub sign: Option<Sign>,
    /// Identity of the peer the frame came from (server-style channels)
    pub identity: Option<String>,
    /// Protocol payload without framing
    pub payload: Bytes,
    /// Error reported by the peer instead of a payload
    pub error: Option<String>,
}

impl InboundMessage {
    pub fn response(sign: Sign, payload: impl Into<Bytes>) -> Self {
        Self {
            sign: Some(sign),
            identity: None,
            payload: payload.into(),
            error: None,
        }
    }

    pub fn unsolicited(payload: impl Into<Bytes>) -> Self {
        Self {
            sign: None,
            identity: None,
            payload: payload.into(),
            error: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}
