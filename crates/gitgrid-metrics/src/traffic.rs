//! Traffic tracker — windowed per-repository read counters.
//!
//! Counters live in process memory only. In a multi-instance deployment
//! each instance sees its own share of the traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gitgrid_state::RepoId;
use tokio::sync::RwLock;
use tracing::debug;

/// Per-repository read counters.
#[derive(Clone, Default)]
pub struct TrafficTracker {
    counters: Arc<RwLock<HashMap<RepoId, Arc<AtomicU64>>>>,
}

impl TrafficTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one read of `repo_id`.
    pub async fn record(&self, repo_id: RepoId) {
        {
            let counters = self.counters.read().await;
            if let Some(counter) = counters.get(&repo_id) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write().await;
        counters
            .entry(repo_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current count for `repo_id`. Does not clear the counter; priority
    /// scoring tolerates the resulting overcount.
    pub async fn read_count(&self, repo_id: RepoId) -> u64 {
        let counters = self.counters.read().await;
        counters
            .get(&repo_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drain every counter at once and return the drained values.
    pub async fn snapshot_and_reset(&self) -> HashMap<RepoId, u64> {
        let drained = {
            let mut counters = self.counters.write().await;
            std::mem::take(&mut *counters)
        };
        drained
            .into_iter()
            .map(|(repo_id, counter)| (repo_id, counter.load(Ordering::Relaxed)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Drop all counters, starting a new traffic window.
    pub async fn decay(&self) {
        let mut counters = self.counters.write().await;
        let tracked = counters.len();
        counters.clear();
        debug!(tracked, "traffic counters decayed");
    }

    /// Non-draining copy of all counters, for exposition.
    pub async fn peek_all(&self) -> Vec<(RepoId, u64)> {
        let counters = self.counters.read().await;
        let mut all: Vec<(RepoId, u64)> = counters
            .iter()
            .map(|(repo_id, c)| (*repo_id, c.load(Ordering::Relaxed)))
            .collect();
        all.sort_by_key(|(repo_id, _)| *repo_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_and_read_does_not_clear() {
        let tracker = TrafficTracker::new();
        for _ in 0..3 {
            tracker.record(7).await;
        }
        assert_eq!(tracker.read_count(7).await, 3);
        assert_eq!(tracker.read_count(7).await, 3);
        assert_eq!(tracker.read_count(8).await, 0);
    }

    #[tokio::test]
    async fn snapshot_drains_everything() {
        let tracker = TrafficTracker::new();
        tracker.record(1).await;
        tracker.record(1).await;
        tracker.record(2).await;

        let snapshot = tracker.snapshot_and_reset().await;
        assert_eq!(snapshot.get(&1), Some(&2));
        assert_eq!(snapshot.get(&2), Some(&1));

        assert!(tracker.snapshot_and_reset().await.is_empty());
        assert_eq!(tracker.read_count(1).await, 0);
    }

    #[tokio::test]
    async fn decay_starts_new_window() {
        let tracker = TrafficTracker::new();
        tracker.record(1).await;
        tracker.decay().await;
        assert!(tracker.peek_all().await.is_empty());

        tracker.record(1).await;
        assert_eq!(tracker.read_count(1).await, 1);
    }

    #[tokio::test]
    async fn concurrent_records_are_counted() {
        let tracker = TrafficTracker::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    tracker.record(42).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(tracker.read_count(42).await, 800);
    }
}
