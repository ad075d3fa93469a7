//! Transport layer beneath channels
//!
//! This module provides the physical transports a channel can own:
//! - TCP client for point-to-point stream devices
//! - UDP for datagram devices
//! - DTU server hosting many dial-in terminals on one listener
//! - Serial line (feature `serial`)
//! - Mock transport for testing
//!
//! # Example
//!
//! ```ignore
//! use fieldlink::transport::{create_transport, Transport};
//! use fieldlink::config::TransportConfig;
//!
//! let transport = create_transport(&TransportConfig::Mock(Default::default()))?;
//! transport.connect().await?;
//! ```

mod adapter;
pub mod dtu;
pub mod error;
pub mod mock;
pub mod tcp;
pub mod udp;

#[cfg(feature = "serial")]
pub mod serial;

pub use adapter::{IncomingFrame, Transport, TransportEvent};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a transport based on configuration
///
/// Nothing is opened here; channels connect on demand.
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Tcp(cfg) => Ok(Arc::new(tcp::TcpClientTransport::new(cfg))),
        TransportConfig::Udp(cfg) => Ok(Arc::new(udp::UdpTransport::new(cfg))),
        TransportConfig::DtuServer(cfg) => Ok(Arc::new(dtu::DtuServerTransport::new(cfg))),
        #[cfg(feature = "serial")]
        TransportConfig::Serial(cfg) => Ok(Arc::new(serial::SerialTransport::new(cfg))),
        #[cfg(not(feature = "serial"))]
        TransportConfig::Serial(_) => Err(TransportError::Unsupported(
            "Serial requires the 'serial' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockTransport::new(cfg))),
    }
}
