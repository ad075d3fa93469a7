//! Per-device runtime options

use std::time::Duration;

/// How a device talks over its channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Remote identity on server-style channels (DTU id)
    pub identity: Option<String>,
    /// Connect the channel on demand when a request finds it offline
    pub auto_connect: bool,
    /// Pause before each send, for slow serial peers
    pub send_delay: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Idle timeout controllers kept for reuse
    pub pool_capacity: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            identity: None,
            auto_connect: true,
            send_delay: Duration::ZERO,
            request_timeout: Duration::from_millis(3000),
            connect_timeout: Duration::from_millis(3000),
            pool_capacity: 4,
        }
    }
}

impl DeviceOptions {
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}
