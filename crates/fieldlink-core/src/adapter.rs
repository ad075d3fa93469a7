//! Framing adapter and protocol contracts
//!
//! A channel installs exactly one [`FrameAdapter`], taken from the protocol of
//! the first device attached to it. Adapters follow the tokio-util `Decoder`
//! convention: `decode` consumes complete frames from the front of the buffer
//! and returns `Ok(None)` while more bytes are needed.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::LinkResult;
use crate::message::{InboundMessage, OutboundMessage, Sign, TransportKind};

/// Turns outbound messages into frames and inbound bytes into messages
pub trait FrameAdapter: Send + Sync {
    /// Frame a request, stamping it with `sign`
    fn encode(&self, message: &OutboundMessage, sign: Sign) -> LinkResult<Bytes>;

    /// Split the next complete message off `buf`
    fn decode(&self, buf: &mut BytesMut) -> LinkResult<Option<InboundMessage>>;
}

/// A device protocol: selects framing per transport and declares sharing rules
pub trait Protocol: Send + Sync {
    /// Protocol name used in logs
    fn name(&self) -> &str;

    /// Framing adapter for the given transport shape
    fn adapter(&self, kind: TransportKind) -> Arc<dyn FrameAdapter>;

    /// Whether several devices speaking this protocol may share one channel
    fn supports_multiple_devices(&self) -> bool {
        true
    }
}
