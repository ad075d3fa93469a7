//! Request counters

use std::sync::atomic::{AtomicU64, Ordering};

use fieldlink_core::{LinkError, LinkResult};

/// Snapshot of a device's request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub requests: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record<T>(&self, result: &LinkResult<T>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(_) => &self.successes,
            Err(e) if e.is_timeout() => &self.timeouts,
            Err(LinkError::Cancelled { .. }) => &self.cancellations,
            Err(_) => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DeviceStats {
        DeviceStats {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldlink_core::Sign;
    use std::time::Duration;

    #[test]
    fn test_record_buckets() {
        let counters = StatsCounters::default();
        counters.record(&Ok::<_, LinkError>(()));
        counters.record::<()>(&Err(LinkError::RequestTimeout {
            sign: Sign(1),
            timeout: Duration::from_millis(10),
        }));
        counters.record::<()>(&Err(LinkError::Cancelled { sign: None }));
        counters.record::<()>(&Err(LinkError::ChannelClosed { sign: Some(Sign(2)) }));

        assert_eq!(
            counters.snapshot(),
            DeviceStats {
                requests: 4,
                successes: 1,
                timeouts: 1,
                cancellations: 1,
                failures: 1,
            }
        );
    }
}
