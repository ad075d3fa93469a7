//! Reusable timeout controller and its per-device pool
//!
//! A controller pairs one re-armable timer with up to three linked
//! cancellation tokens. Requests are issued in tight polling loops, so the
//! timer is reset and reused instead of building a new one for every wait.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

/// Far-off deadline parked on an idle timer
const IDLE_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Maximum number of linked tokens per wait
pub const MAX_LINKS: usize = 3;

/// Why a bounded wait ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The controller's own timer fired
    Timer,
    /// The linked token at this index was cancelled
    Link(usize),
}

/// One-shot timer plus linked cancellation, reusable across waits
pub struct TimeoutController {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
    timed_out: bool,
    deadline: Option<Instant>,
}

impl TimeoutController {
    pub fn new() -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep_until(Instant::now() + IDLE_DEADLINE)),
            armed: false,
            timed_out: false,
            deadline: None,
        }
    }

    /// Arm the timer to fire `timeout` from now and clear the timed-out flag
    pub fn set(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.sleep.as_mut().reset(deadline);
        self.deadline = Some(deadline);
        self.armed = true;
        self.timed_out = false;
    }

    /// Disarm the timer so the controller can be handed to the next borrower
    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + IDLE_DEADLINE);
        self.deadline = None;
        self.armed = false;
        self.timed_out = false;
    }

    /// True once the timer fired during the last `run`
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Time left before the timer fires, if armed
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` until it finishes, the timer fires, or a linked token is cancelled
    ///
    /// A completed future wins over a simultaneous cancellation.
    pub async fn run<F>(
        &mut self,
        fut: F,
        links: [Option<&CancellationToken>; MAX_LINKS],
    ) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        let armed = self.armed;
        let [first, second, third] = links;
        tokio::pin!(fut);

        let outcome = tokio::select! {
            biased;
            out = &mut fut => Ok(out),
            _ = linked(first) => Err(Interrupted::Link(0)),
            _ = linked(second) => Err(Interrupted::Link(1)),
            _ = linked(third) => Err(Interrupted::Link(2)),
            _ = &mut self.sleep, if armed => Err(Interrupted::Timer),
        };

        if matches!(outcome, Err(Interrupted::Timer)) {
            self.timed_out = true;
        }
        outcome
    }
}

async fn linked(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl Default for TimeoutController {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded free-list of controllers, scoped to one device
pub struct TimeoutPool {
    free: Mutex<Vec<TimeoutController>>,
    capacity: usize,
    allocated: AtomicUsize,
    closed: AtomicBool,
}

impl TimeoutPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            allocated: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Borrow a controller; it goes back to the pool when the guard drops
    pub fn borrow(&self) -> PooledTimeout<'_> {
        let controller = self.free.lock().pop().unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            TimeoutController::new()
        });
        PooledTimeout {
            controller: Some(controller),
            pool: self,
        }
    }

    /// Controllers waiting in the free-list
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Controllers ever created by this pool
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Drop every pooled controller and stop accepting returns
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.free.lock().clear();
    }

    fn give_back(&self, mut controller: TimeoutController) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        controller.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(controller);
        }
    }
}

/// Borrowed controller, returned to its pool on drop
pub struct PooledTimeout<'a> {
    controller: Option<TimeoutController>,
    pool: &'a TimeoutPool,
}

impl Deref for PooledTimeout<'_> {
    type Target = TimeoutController;

    fn deref(&self) -> &Self::Target {
        match &self.controller {
            Some(controller) => controller,
            None => unreachable!("controller is only taken on drop"),
        }
    }
}

impl DerefMut for PooledTimeout<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.controller {
            Some(controller) => controller,
            None => unreachable!("controller is only taken on drop"),
        }
    }
}

impl Drop for PooledTimeout<'_> {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            self.pool.give_back(controller);
        }
    }
}
