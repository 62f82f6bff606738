//! Stale RUNNING reconciler.
//!
//! A worker that dies mid-transfer leaves its task RUNNING. With a lease
//! configured, tasks untouched for longer than the lease go back to
//! PENDING and will be claimed again. The lease must exceed the transfer
//! timeout or live transfers will be re-run.

use std::time::Duration;

use tracing::warn;

use gitgrid_state::{StateStore, TaskId};

use crate::error::QueueResult;

pub struct StaleTaskReconciler {
    state: StateStore,
    lease: Duration,
}

impl StaleTaskReconciler {
    pub fn new(state: StateStore, lease: Duration) -> Self {
        Self { state, lease }
    }

    pub fn reconcile(&self, now: u64) -> QueueResult<Vec<TaskId>> {
        let cutoff = now.saturating_sub(self.lease.as_millis() as u64);
        let requeued = self.state.requeue_stale_running(cutoff, now)?;
        if !requeued.is_empty() {
            warn!(count = requeued.len(), ?requeued, "stale running tasks returned to pending");
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitgrid_state::{NewTask, TaskStatus};

    #[test]
    fn only_expired_leases_are_requeued() {
        let store = StateStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for repo_id in 1..=2 {
            ids.push(
                store
                    .enqueue_task(
                        &NewTask {
                            repo_id,
                            source_node_id: "node-a".to_string(),
                            target_node_id: "node-b".to_string(),
                            priority: 1,
                        },
                        0,
                    )
                    .unwrap()
                    .unwrap(),
            );
        }
        store.claim_task(ids[0], 1_000).unwrap();
        store.claim_task(ids[1], 50_000).unwrap();

        let reconciler = StaleTaskReconciler::new(store.clone(), Duration::from_secs(30));
        assert_eq!(reconciler.reconcile(60_000).unwrap(), vec![ids[0]]);
        assert_eq!(store.get_task(ids[0]).unwrap().unwrap().status, TaskStatus::Pending);
        assert_eq!(store.get_task(ids[1]).unwrap().unwrap().status, TaskStatus::Running);

        // Requeued task keeps its outstanding slot: no duplicate on enqueue.
        let dup = store
            .enqueue_task(
                &NewTask {
                    repo_id: 1,
                    source_node_id: "node-a".to_string(),
                    target_node_id: "node-b".to_string(),
                    priority: 1,
                },
                60_001,
            )
            .unwrap();
        assert!(dup.is_none());
    }
}
