//! Channel and device configuration
//!
//! Configuration is plain TOML. Each `[[channels]]` entry names one physical
//! transport and the devices attached to it:
//!
//! ```toml
//! [poll]
//! interval_ms = 1000
//!
//! [[channels]]
//! name = "line-1"
//! transport = { type = "tcp", host = "10.0.0.5", port = 502 }
//!
//! [[channels.devices]]
//! name = "meter-a"
//! request = "0103000a0002"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use fieldlink_core::DataType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DeviceOptions;

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldlinkConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub poll: PollConfig,
}

impl FieldlinkConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.interval_ms == 0 {
            return Err(ConfigError::Invalid("poll.interval_ms must be > 0".into()));
        }
        let mut channel_names = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !channel_names.insert(channel.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
        }
        Ok(())
    }
}

/// Polling schedule used by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}

// =============================================================================
// Channel Configuration
// =============================================================================

/// One physical channel and the devices sharing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl ChannelConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("channel name must not be empty".into()));
        }
        self.transport.validate(&self.name)?;

        let mut names = HashSet::new();
        for device in &self.devices {
            device.validate(&self.name)?;
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name '{}' on channel '{}'",
                    device.name, self.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// TCP client to a single remote endpoint
    Tcp(TcpConfig),
    /// UDP socket connected to a single remote
    Udp(UdpConfig),
    /// TCP listener hosting dial-in DTU terminals
    DtuServer(DtuServerConfig),
    /// Serial line (needs the `serial` feature at runtime)
    Serial(SerialConfig),
    /// Mock transport for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

impl TransportConfig {
    fn validate(&self, channel: &str) -> Result<(), ConfigError> {
        let problem = match self {
            Self::Tcp(cfg) if cfg.host.is_empty() => Some("tcp host must not be empty"),
            Self::Tcp(cfg) if cfg.connect_timeout_ms == 0 => {
                Some("tcp connect_timeout_ms must be > 0")
            }
            Self::Udp(cfg) if cfg.remote.is_empty() => Some("udp remote must not be empty"),
            Self::DtuServer(cfg) if cfg.registration_timeout_ms == 0 => {
                Some("dtu_server registration_timeout_ms must be > 0")
            }
            Self::Serial(cfg) if cfg.path.is_empty() => Some("serial path must not be empty"),
            _ => None,
        };
        match problem {
            Some(msg) => Err(ConfigError::Invalid(format!("channel '{}': {}", channel, msg))),
            None => Ok(()),
        }
    }
}

/// TCP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// UDP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Local bind address
    #[serde(default = "default_udp_local")]
    pub local: String,
    /// Remote address, `host:port`
    pub remote: String,
}

fn default_udp_local() -> String {
    "0.0.0.0:0".to_string()
}

/// DTU server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtuServerConfig {
    /// Listen address, `host:port`
    pub bind: String,
    /// How long a new connection has to send its registration packet
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_ms: u64,
}

fn default_registration_timeout() -> u64 {
    10_000
}

/// Serial line configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g. "/dev/ttyUSB0")
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    9600
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// Device Configuration
// =============================================================================

/// One logical device on a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Remote identity on server-style channels (DTU id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Whether several devices may share this device's channel
    #[serde(default = "default_true")]
    pub multi_device: bool,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Pause before each send (milliseconds)
    #[serde(default)]
    pub send_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Idle timeout controllers kept for reuse
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Poll request payload in hex (e.g. "0103000a0002")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    /// Values decoded from each poll response
    #[serde(default)]
    pub points: Vec<PointConfig>,
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    3000
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_pool_capacity() -> usize {
    4
}

impl DeviceConfig {
    /// Runtime options for this device
    pub fn options(&self) -> DeviceOptions {
        let mut options = DeviceOptions::default()
            .with_auto_connect(self.auto_connect)
            .with_send_delay(Duration::from_millis(self.send_delay_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_pool_capacity(self.pool_capacity);
        if let Some(identity) = &self.identity {
            options = options.with_identity(identity.clone());
        }
        options
    }

    /// Decoded poll request, if one is configured
    pub fn request_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.request
            .as_deref()
            .map(|hex_str| {
                hex::decode(hex_str.trim()).map_err(|e| {
                    ConfigError::Invalid(format!("device '{}': bad request hex: {}", self.name, e))
                })
            })
            .transpose()
    }

    fn validate(&self, channel: &str) -> Result<(), ConfigError> {
        let fail = |msg: &str| {
            Err(ConfigError::Invalid(format!(
                "channel '{}', device '{}': {}",
                channel, self.name, msg
            )))
        };
        if self.name.trim().is_empty() {
            return fail("device name must not be empty");
        }
        if self.request_timeout_ms == 0 {
            return fail("request_timeout_ms must be > 0");
        }
        if self.connect_timeout_ms == 0 {
            return fail("connect_timeout_ms must be > 0");
        }
        if matches!(&self.identity, Some(id) if id.trim().is_empty()) {
            return fail("identity must not be empty");
        }
        self.request_bytes()?;
        Ok(())
    }
}

/// A value decoded out of a device response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    pub name: String,
    /// Byte offset, optionally with a bit (`"4"`, `"4.3"`)
    #[serde(default)]
    pub address: String,
    pub data_type: DataType,
    #[serde(default = "default_array_len")]
    pub array_len: usize,
}

fn default_array_len() -> usize {
    1
}
