//! Sign-tagged reference framing
//!
//! Frame layout (big-endian):
//!
//! ```text
//! +------------+-----------+------------+-------------------+
//! | sign (u16) | flags (u8)| len (u16)  | payload (len)     |
//! +------------+-----------+------------+-------------------+
//! ```
//!
//! Sign 0 marks an unsolicited frame. Flag bit 0 marks an error response
//! whose payload is a UTF-8 message.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fieldlink_core::{
    FrameAdapter, InboundMessage, LinkError, LinkResult, OutboundMessage, Protocol, Sign,
    TransportKind,
};

/// Header length: sign (2) + flags (1) + payload length (2)
pub const HEADER_LEN: usize = 5;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const FLAG_ERROR: u8 = 0x01;

/// Framing adapter for the sign-tagged layout
#[derive(Debug, Clone, Copy, Default)]
pub struct SignedFrameAdapter;

impl SignedFrameAdapter {
    fn frame(sign: u16, flags: u8, payload: &[u8]) -> LinkResult<Bytes> {
        if payload.len() > MAX_PAYLOAD {
            return Err(LinkError::Protocol(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u16(sign);
        buf.put_u8(flags);
        buf.put_u16(payload.len() as u16);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Successful response frame, as a peer would send it
    pub fn response(sign: u16, payload: &[u8]) -> LinkResult<Bytes> {
        Self::frame(sign, 0, payload)
    }

    /// Error response frame carrying a message instead of a payload
    pub fn error_response(sign: u16, message: &str) -> LinkResult<Bytes> {
        Self::frame(sign, FLAG_ERROR, message.as_bytes())
    }

    /// Frame not tied to any request
    pub fn unsolicited(payload: &[u8]) -> LinkResult<Bytes> {
        Self::frame(0, 0, payload)
    }

    /// Sign of a complete frame, without consuming it
    pub fn peek_sign(frame: &[u8]) -> Option<u16> {
        if frame.len() < HEADER_LEN {
            return None;
        }
        Some(u16::from_be_bytes([frame[0], frame[1]]))
    }
}

impl FrameAdapter for SignedFrameAdapter {
    fn encode(&self, message: &OutboundMessage, sign: Sign) -> LinkResult<Bytes> {
        let wire_sign = u16::try_from(sign.get())
            .ok()
            .filter(|s| *s != 0)
            .ok_or_else(|| LinkError::Protocol(format!("sign {} does not fit frame", sign)))?;
        Self::frame(wire_sign, 0, &message.payload)
    }

    fn decode(&self, buf: &mut BytesMut) -> LinkResult<Option<InboundMessage>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        let sign = buf.get_u16();
        let flags = buf.get_u8();
        buf.advance(2);
        let payload = buf.split_to(len).freeze();

        if flags & !FLAG_ERROR != 0 {
            return Err(LinkError::Protocol(format!("unknown frame flags 0x{:02x}", flags)));
        }

        let sign = (sign != 0).then(|| Sign(u32::from(sign)));
        let message = if flags & FLAG_ERROR != 0 {
            InboundMessage {
                sign,
                identity: None,
                payload: Bytes::new(),
                error: Some(String::from_utf8_lossy(&payload).into_owned()),
            }
        } else {
            InboundMessage {
                sign,
                identity: None,
                payload,
                error: None,
            }
        };
        Ok(Some(message))
    }
}

/// Protocol using [`SignedFrameAdapter`] on every transport
#[derive(Debug, Clone)]
pub struct SignedProtocol {
    name: String,
    multi_device: bool,
}

impl SignedProtocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            multi_device: true,
        }
    }

    /// Refuse to share a channel with other devices
    pub fn exclusive(mut self) -> Self {
        self.multi_device = false;
        self
    }

    pub fn with_multi_device(mut self, multi_device: bool) -> Self {
        self.multi_device = multi_device;
        self
    }
}

impl Default for SignedProtocol {
    fn default() -> Self {
        Self::new("signed")
    }
}

impl Protocol for SignedProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter(&self, _kind: TransportKind) -> Arc<dyn FrameAdapter> {
        Arc::new(SignedFrameAdapter)
    }

    fn supports_multiple_devices(&self) -> bool {
        self.multi_device
    }
}
