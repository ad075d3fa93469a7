//! Correlation registry: sign -> pending waiter

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fieldlink_core::{InboundMessage, LinkError, LinkResult, Sign};
use tokio::sync::oneshot;
use tracing::debug;

/// Default correlation space: signs fit a 16-bit transaction id
pub const DEFAULT_SIGN_SPACE: u32 = u16::MAX as u32;

/// Why a waiter was cancelled from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Channel (or this identity's sub-connection) was torn down
    ChannelClosed,
    /// Owning device was disposed
    Disposed,
}

/// How a waiter was resolved by the registry side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Response(InboundMessage),
    Cancelled(CancelReason),
}

/// Terminal state of a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Pending,
    Succeeded,
    TimedOut,
    Cancelled,
    Closed,
    Disposed,
}

struct Slot {
    ticket: u64,
    tx: oneshot::Sender<WaitOutcome>,
}

/// Per-endpoint map of outstanding requests
///
/// Whoever removes a sign's slot from the map owns its resolution, so every
/// waiter reaches exactly one terminal state no matter how a response, a
/// timeout and a cancellation race.
pub struct CorrelationRegistry {
    pending: DashMap<Sign, Slot>,
    next_sign: AtomicU32,
    next_ticket: AtomicU64,
    sign_space: u32,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::with_sign_space(DEFAULT_SIGN_SPACE)
    }

    /// Registry issuing signs in `1..=sign_space`
    pub fn with_sign_space(sign_space: u32) -> Self {
        Self {
            pending: DashMap::new(),
            next_sign: AtomicU32::new(0),
            next_ticket: AtomicU64::new(0),
            sign_space: sign_space.max(1),
        }
    }

    fn candidate(&self) -> Sign {
        let raw = self.next_sign.fetch_add(1, Ordering::Relaxed);
        Sign(raw % self.sign_space + 1)
    }

    /// Take the next sign without registering a waiter (fire-and-forget sends)
    pub fn allocate_sign(&self) -> Sign {
        loop {
            let sign = self.candidate();
            if !self.pending.contains_key(&sign) || self.pending.len() >= self.sign_space as usize {
                return sign;
            }
        }
    }

    /// Register a new waiter under a sign that is not currently outstanding
    pub fn register(self: &Arc<Self>) -> LinkResult<Waiter> {
        if self.pending.len() >= self.sign_space as usize {
            return Err(LinkError::InvalidOperation(format!(
                "Correlation space exhausted ({} outstanding)",
                self.pending.len()
            )));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        loop {
            let sign = self.candidate();
            if let Entry::Vacant(vacant) = self.pending.entry(sign) {
                if let Some(tx) = tx.take() {
                    vacant.insert(Slot { ticket, tx });
                }
                return Ok(Waiter {
                    sign,
                    ticket,
                    registry: Arc::clone(self),
                    rx,
                    state: WaitState::Pending,
                });
            }
        }
    }

    /// Complete the waiter registered under `sign` with `message`
    ///
    /// Returns false when nothing is waiting on that sign.
    pub fn complete(&self, sign: Sign, message: &InboundMessage) -> bool {
        match self.pending.remove(&sign) {
            Some((_, slot)) => slot.tx.send(WaitOutcome::Response(message.clone())).is_ok(),
            None => false,
        }
    }

    /// Cancel one outstanding waiter
    pub fn cancel(&self, sign: Sign, reason: CancelReason) -> bool {
        match self.pending.remove(&sign) {
            Some((_, slot)) => slot.tx.send(WaitOutcome::Cancelled(reason)).is_ok(),
            None => false,
        }
    }

    /// Cancel every outstanding waiter, returning how many were resolved
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let signs: Vec<Sign> = self.pending.iter().map(|entry| *entry.key()).collect();
        let cancelled = signs
            .into_iter()
            .filter(|sign| self.cancel(*sign, reason))
            .count();
        if cancelled > 0 {
            debug!(cancelled, ?reason, "Cancelled pending waiters");
        }
        cancelled
    }

    pub fn is_pending(&self, sign: Sign) -> bool {
        self.pending.contains_key(&sign)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn release(&self, sign: Sign, ticket: u64) -> bool {
        self.pending
            .remove_if(&sign, |_, slot| slot.ticket == ticket)
            .is_some()
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending completion for one sign
///
/// Dropping a waiter that is still pending removes its slot, so an abandoned
/// request never leaves a stale sign behind.
pub struct Waiter {
    sign: Sign,
    ticket: u64,
    registry: Arc<CorrelationRegistry>,
    rx: oneshot::Receiver<WaitOutcome>,
    state: WaitState,
}

impl Waiter {
    pub fn sign(&self) -> Sign {
        self.sign
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Non-blocking check for a completion that already arrived
    pub fn try_take(&mut self) -> Option<WaitOutcome> {
        if self.state != WaitState::Pending {
            return None;
        }
        match self.rx.try_recv() {
            Ok(outcome) => Some(self.settle(outcome)),
            Err(_) => None,
        }
    }

    /// Wait until the registry side resolves this waiter
    pub async fn wait(&mut self) -> WaitOutcome {
        let outcome = match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // Registry dropped together with its channel
            Err(_) => WaitOutcome::Cancelled(CancelReason::ChannelClosed),
        };
        self.settle(outcome)
    }

    /// Claim the waiter for a local terminal state (timeout, caller cancel)
    ///
    /// Returns `None` when the claim succeeded. If a response or registry
    /// cancellation got there first, that outcome is returned instead and
    /// the requested state is not applied.
    pub async fn expire(&mut self, state: WaitState) -> Option<WaitOutcome> {
        if self.state != WaitState::Pending {
            return None;
        }
        if self.registry.release(self.sign, self.ticket) {
            self.state = state;
            return None;
        }
        // The winner removed the slot and is sending right now
        Some(self.wait().await)
    }

    fn settle(&mut self, outcome: WaitOutcome) -> WaitOutcome {
        self.state = match &outcome {
            WaitOutcome::Response(_) => WaitState::Succeeded,
            WaitOutcome::Cancelled(CancelReason::ChannelClosed) => WaitState::Closed,
            WaitOutcome::Cancelled(CancelReason::Disposed) => WaitState::Disposed,
        };
        outcome
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.state == WaitState::Pending {
            self.registry.release(self.sign, self.ticket);
        }
    }
}
