//! Per-endpoint request serialization

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// At most one in-flight request per logical endpoint
///
/// Acquire suspends without blocking a worker thread; release is dropping
/// the returned guard.
#[derive(Debug, Clone, Default)]
pub struct EndpointLock {
    inner: Arc<Mutex<()>>,
}

/// Held for the whole send-and-wait of one request
#[derive(Debug)]
pub struct EndpointGuard {
    _guard: OwnedMutexGuard<()>,
}

impl EndpointLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> EndpointGuard {
        EndpointGuard {
            _guard: self.inner.clone().lock_owned().await,
        }
    }

    pub fn try_acquire(&self) -> Option<EndpointGuard> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| EndpointGuard { _guard: guard })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Identity-scoped locks for channels hosting many peers
///
/// Unrelated identities never contend on the same lock.
#[derive(Debug, Default)]
pub struct EndpointLocks {
    locks: DashMap<String, EndpointLock>,
}

impl EndpointLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> EndpointLock {
        self.locks
            .entry(identity.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub fn remove(&self, identity: &str) {
        self.locks.remove(identity);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
