//! Replication metrics seam.
//!
//! Components record through `dyn ReplicationMetrics`. When replication is
//! disabled the daemon wires in [`NoopMetrics`]; otherwise
//! [`ReplicationCounters`], whose values are exported at `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait ReplicationMetrics: Send + Sync {
    /// Pending tasks observed by the last worker poll.
    fn set_pending(&self, count: u64);
    fn record_enqueued(&self, count: u64);
    fn record_task_succeeded(&self);
    fn record_task_failed(&self);
    fn record_dead_lettered(&self);
    fn record_failover(&self);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl ReplicationMetrics for NoopMetrics {
    fn set_pending(&self, _count: u64) {}
    fn record_enqueued(&self, _count: u64) {}
    fn record_task_succeeded(&self) {}
    fn record_task_failed(&self) {}
    fn record_dead_lettered(&self) {}
    fn record_failover(&self) {}
}

/// Lock-free counters.
#[derive(Debug, Default)]
pub struct ReplicationCounters {
    pending: AtomicU64,
    enqueued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    failovers: AtomicU64,
}

/// Point-in-time copy of [`ReplicationCounters`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationSnapshot {
    pub pending: u64,
    pub enqueued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub failovers: u64,
}

impl ReplicationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ReplicationSnapshot {
        ReplicationSnapshot {
            pending: self.pending.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
        }
    }
}

impl ReplicationMetrics for ReplicationCounters {
    fn set_pending(&self, count: u64) {
        self.pending.store(count, Ordering::Relaxed);
    }

    fn record_enqueued(&self, count: u64) {
        self.enqueued.fetch_add(count, Ordering::Relaxed);
    }

    fn record_task_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn record_task_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = ReplicationCounters::new();
        counters.record_enqueued(3);
        counters.record_enqueued(2);
        counters.record_task_succeeded();
        counters.record_task_failed();
        counters.record_dead_lettered();
        counters.record_failover();

        let snap = counters.snapshot();
        assert_eq!(snap.enqueued, 5);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.dead_lettered, 1);
        assert_eq!(snap.failovers, 1);
    }

    #[test]
    fn pending_is_a_gauge() {
        let counters = ReplicationCounters::new();
        counters.set_pending(12);
        counters.set_pending(0);
        assert_eq!(counters.snapshot().pending, 0);
    }
}
