//! Error taxonomy for channel and device operations

use std::time::Duration;

use thiserror::Error;

use crate::message::Sign;

/// Result type for channel and device operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors a request, connect or attach can resolve to
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Channel is not connected and could not be (or may not be) connected
    #[error("Channel offline: {}{}", .reason, sign_suffix(.sign))]
    ChannelOffline { reason: String, sign: Option<Sign> },

    /// Connect attempt did not finish within the configured connect timeout
    #[error("Timeout connecting channel after {}ms{}", .timeout.as_millis(), sign_suffix(.sign))]
    ConnectTimeout {
        timeout: Duration,
        sign: Option<Sign>,
    },

    /// No response arrived within the request timeout
    #[error("Timeout waiting for response (sign: {sign}, timeout: {}ms)", .timeout.as_millis())]
    RequestTimeout { sign: Sign, timeout: Duration },

    /// Caller cancelled the operation
    #[error("Cancelled by caller{}", sign_suffix(.sign))]
    Cancelled { sign: Option<Sign> },

    /// Channel was torn down while the request was outstanding
    #[error("Channel closed{}", sign_suffix(.sign))]
    ChannelClosed { sign: Option<Sign> },

    /// Error reported by the framing/codec layer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport refused or failed a send on an online channel
    #[error("Transport error: {}{}", .reason, sign_suffix(.sign))]
    Transport { reason: String, sign: Option<Sign> },

    /// Structural misuse (attaching to a channel that does not accept it, etc.)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Device has been disposed
    #[error("Device disposed")]
    Disposed,
}

fn sign_suffix(sign: &Option<Sign>) -> String {
    match sign {
        Some(sign) => format!(" (sign: {})", sign),
        None => String::new(),
    }
}

impl LinkError {
    pub fn offline(reason: impl Into<String>) -> Self {
        LinkError::ChannelOffline {
            reason: reason.into(),
            sign: None,
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        LinkError::Transport {
            reason: reason.into(),
            sign: None,
        }
    }

    /// Correlation sign carried by the error, if any
    pub fn sign(&self) -> Option<Sign> {
        match self {
            LinkError::RequestTimeout { sign, .. } => Some(*sign),
            LinkError::Cancelled { sign }
            | LinkError::ChannelClosed { sign }
            | LinkError::ChannelOffline { sign, .. }
            | LinkError::ConnectTimeout { sign, .. }
            | LinkError::Transport { sign, .. } => *sign,
            _ => None,
        }
    }

    /// Attach a sign to an error that was raised before one was known
    ///
    /// Protocol errors carry only text, so the sign is appended to it.
    pub fn with_sign(self, sign: Sign) -> Self {
        match self {
            LinkError::Cancelled { sign: None } => LinkError::Cancelled { sign: Some(sign) },
            LinkError::ChannelClosed { sign: None } => LinkError::ChannelClosed { sign: Some(sign) },
            LinkError::ChannelOffline { reason, sign: None } => LinkError::ChannelOffline {
                reason,
                sign: Some(sign),
            },
            LinkError::ConnectTimeout { timeout, sign: None } => LinkError::ConnectTimeout {
                timeout,
                sign: Some(sign),
            },
            LinkError::Transport { reason, sign: None } => LinkError::Transport {
                reason,
                sign: Some(sign),
            },
            LinkError::Protocol(message) if !message.contains("(sign: ") => {
                LinkError::Protocol(format!("{} (sign: {})", message, sign))
            }
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LinkError::RequestTimeout { .. } | LinkError::ConnectTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_message_carries_sign() {
        let err = LinkError::RequestTimeout {
            sign: Sign(8),
            timeout: Duration::from_millis(200),
        };
        let msg = err.to_string();
        assert!(msg.contains("Timeout"));
        assert!(msg.contains("sign: 8"));
        assert_eq!(err.sign(), Some(Sign(8)));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_cancelled_and_closed_are_distinct() {
        let cancelled = LinkError::Cancelled { sign: Some(Sign(3)) };
        let closed = LinkError::ChannelClosed { sign: Some(Sign(3)) };
        assert_ne!(cancelled, closed);
        assert_eq!(cancelled.to_string(), "Cancelled by caller (sign: 3)");
        assert_eq!(closed.to_string(), "Channel closed (sign: 3)");
        assert!(!cancelled.is_timeout());
    }

    #[test]
    fn test_with_sign_fills_missing_sign_only() {
        let err = LinkError::ChannelClosed { sign: None }.with_sign(Sign(4));
        assert_eq!(err.sign(), Some(Sign(4)));

        let err = LinkError::Cancelled { sign: Some(Sign(1)) }.with_sign(Sign(9));
        assert_eq!(err.sign(), Some(Sign(1)));

        assert_eq!(LinkError::Disposed.with_sign(Sign(2)), LinkError::Disposed);
    }

    #[test]
    fn test_with_sign_reaches_offline_transport_and_protocol() {
        let err = LinkError::offline("auto-connect is disabled").with_sign(Sign(5));
        assert_eq!(err.sign(), Some(Sign(5)));
        assert_eq!(
            err.to_string(),
            "Channel offline: auto-connect is disabled (sign: 5)"
        );

        let err = LinkError::transport("broken pipe").with_sign(Sign(6));
        assert_eq!(err.to_string(), "Transport error: broken pipe (sign: 6)");

        let err = LinkError::Protocol("payload too large".into()).with_sign(Sign(7));
        assert_eq!(err.to_string(), "Protocol error: payload too large (sign: 7)");
        // Already tagged text is left alone
        assert_eq!(err.clone().with_sign(Sign(9)), err);

        let err = LinkError::ConnectTimeout {
            timeout: Duration::from_millis(100),
            sign: None,
        }
        .with_sign(Sign(3));
        assert!(err.to_string().ends_with("(sign: 3)"));
        assert!(err.is_timeout());
    }
}
