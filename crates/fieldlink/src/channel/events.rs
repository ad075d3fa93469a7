//! Channel lifecycle and receive-path callbacks

use async_trait::async_trait;
use fieldlink_core::{InboundMessage, LinkResult};

use super::Channel;

/// Whether a handler consumed an event
///
/// The first handler to return [`EventFlow::Handled`] stops propagation to
/// handlers attached after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Handled,
}

impl EventFlow {
    pub fn is_handled(self) -> bool {
        self == EventFlow::Handled
    }
}

/// Lifecycle stage being broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Callbacks a channel member receives
///
/// Handlers are invoked in attach order. The channel never holds its
/// membership lock while calling into a handler.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Transport is about to connect
    async fn on_starting(&self, _channel: &Channel) -> EventFlow {
        EventFlow::Continue
    }

    /// Transport connected and the receive path is running
    async fn on_started(&self, _channel: &Channel) -> EventFlow {
        EventFlow::Continue
    }

    /// Channel is tearing down
    async fn on_stopping(&self, _channel: &Channel) -> EventFlow {
        EventFlow::Continue
    }

    /// Transport closed and pending waiters cancelled
    async fn on_stopped(&self, _channel: &Channel) -> EventFlow {
        EventFlow::Continue
    }

    /// A decoded inbound message
    ///
    /// Runs on the receive path. Errors are logged by the channel and
    /// delivery continues with the next handler.
    fn on_message(&self, channel: &Channel, message: &InboundMessage) -> LinkResult<EventFlow>;
}
