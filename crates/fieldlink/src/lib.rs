//! fieldlink - Shared-channel request/response coordination
//!
//! Many logical devices share a few physical transports. This crate decides
//! who may talk when, matches every response to the request that asked for
//! it, and tears channels down when their last device leaves.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Device (one per logical endpoint)                           │
//! │   connect-on-demand ── EndpointLock ── TimeoutPool           │
//! │            │                                                 │
//! │            ▼                                                 │
//! │  Channel (one per transport)                                 │
//! │   membership ── CorrelationRegistry ── receive pump          │
//! │            │                                                 │
//! │            ▼                                                 │
//! │  Transport (TCP / UDP / DTU server / serial / mock)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fieldlink::{Channel, Device, DeviceOptions, SignedProtocol};
//! use fieldlink::transport::mock::MockTransport;
//!
//! let channel = Channel::new("line-1", Arc::new(MockTransport::new(&Default::default())));
//! let meter = Device::new("meter", Arc::new(SignedProtocol::default()), DeviceOptions::default());
//! meter.attach(&channel, None)?;
//! let reply = meter
//!     .send_then_return(&OutboundMessage::new(vec![0x01]), &CancellationToken::new())
//!     .await?;
//! ```

pub mod channel;
pub mod config;
pub mod device;
pub mod framing;
pub mod sync;
pub mod transport;

pub use channel::{Channel, ChannelHandler, ChannelState, EventFlow};
pub use config::{ChannelConfig, ConfigError, DeviceConfig, FieldlinkConfig, TransportConfig};
pub use device::{Device, DeviceId, DeviceOptions, DeviceStats};
pub use framing::{SignedFrameAdapter, SignedProtocol};
pub use sync::{CorrelationRegistry, EndpointLock, TimeoutController, TimeoutPool};
pub use transport::{create_transport, Transport, TransportError, TransportEvent};

// Re-export for convenience
pub use fieldlink_core::{
    InboundMessage, LinkError, LinkResult, OutboundMessage, Protocol, Sign, TransportKind,
};
