use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Router counters for observability.
///
/// Cumulative since the router started. Use with Prometheus, OpenTelemetry,
/// or whatever the embedding service exports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterMetrics {
    /// `publish` calls on this member.
    pub published: u64,
    /// Events sent to a remote owner.
    pub forwarded: u64,
    /// Events fanned out by this member as owner.
    pub broadcast: u64,
    /// `on_event` callbacks made on local subscriptions.
    pub delivered: u64,
    /// Events dropped: no members, ownership in transition, or not owner.
    pub dropped: u64,
    /// Sends that failed or timed out.
    pub transport_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RouterCounters {
    published: AtomicU64,
    forwarded: AtomicU64,
    broadcast: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    transport_failures: AtomicU64,
}

impl RouterCounters {
    pub(crate) fn published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn broadcast(&self) {
        self.broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self, count: u64) {
        self.delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RouterMetrics {
        RouterMetrics {
            published: self.published.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let counters = RouterCounters::default();
        counters.published();
        counters.published();
        counters.delivered(3);
        counters.transport_failure();

        let metrics = counters.snapshot();
        assert_eq!(metrics.published, 2);
        assert_eq!(metrics.delivered, 3);
        assert_eq!(metrics.transport_failures, 1);
        assert_eq!(metrics.dropped, 0);
    }
}
