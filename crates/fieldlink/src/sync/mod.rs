//! Synchronization primitives on the request hot path
//!
//! - [`CorrelationRegistry`] matches responses to waiters by sign
//! - [`EndpointLock`] keeps one request in flight per endpoint
//! - [`TimeoutPool`] hands out reusable [`TimeoutController`]s

pub mod correlation;
pub mod endpoint_lock;
pub mod timeout;

pub use correlation::{CancelReason, CorrelationRegistry, WaitOutcome, WaitState, Waiter};
pub use endpoint_lock::{EndpointGuard, EndpointLock, EndpointLocks};
pub use timeout::{Interrupted, PooledTimeout, TimeoutController, TimeoutPool};
