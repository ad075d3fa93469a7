//! fieldlink-core - Core traits and types for fieldlink
//!
//! This crate holds the contracts shared between the coordination layer and
//! the pieces it consumes but does not implement: protocol framing adapters,
//! the typed value converter, and the error taxonomy every request resolves to.

pub mod adapter;
pub mod codec;
pub mod error;
pub mod message;

pub use adapter::{FrameAdapter, Protocol};
pub use codec::{BigEndianConverter, Converted, DataType, Value, ValueConverter};
pub use error::{LinkError, LinkResult};
pub use message::{InboundMessage, OutboundMessage, Sign, TransportKind};
