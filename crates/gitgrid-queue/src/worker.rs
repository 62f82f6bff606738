//! Replication worker — polls, claims, and runs tasks for the local node.
//!
//! The pool size is the backpressure: a task is only claimed once a permit
//! is held, so a saturated node leaves the rest PENDING for the next poll.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, error};

use gitgrid_metrics::ReplicationMetrics;
use gitgrid_state::{NodeId, ReplicationTask, StateStore, TaskStatus, epoch_millis};

use crate::error::QueueResult;
use crate::processor::TaskProcessor;

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub pending: usize,
    pub claimed: usize,
    /// Claims lost to another worker.
    pub lost: usize,
}

pub struct ReplicationWorker {
    state: StateStore,
    node_id: NodeId,
    processor: Arc<TaskProcessor>,
    metrics: Arc<dyn ReplicationMetrics>,
    batch_size: usize,
    parallelism: usize,
    permits: Arc<Semaphore>,
}

impl ReplicationWorker {
    pub fn new(
        state: StateStore,
        node_id: impl Into<NodeId>,
        processor: Arc<TaskProcessor>,
        metrics: Arc<dyn ReplicationMetrics>,
        batch_size: usize,
        parallelism: usize,
    ) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            state,
            node_id: node_id.into(),
            processor,
            metrics,
            batch_size,
            parallelism,
            permits: Arc::new(Semaphore::new(parallelism)),
        }
    }

    /// Fetch the highest-priority PENDING tasks for this node, claim as many
    /// as the pool has room for, and submit them.
    pub async fn poll_once(&self) -> QueueResult<PollSummary> {
        let pending = self.state.list_pending_for_target(&self.node_id, self.batch_size)?;
        self.claim_and_submit(pending)
    }

    /// Claim tasks from a PENDING snapshot. Tasks another worker claimed
    /// since the snapshot was taken are counted as lost and skipped.
    fn claim_and_submit(&self, pending: Vec<ReplicationTask>) -> QueueResult<PollSummary> {
        let mut summary = PollSummary {
            pending: pending.len(),
            ..PollSummary::default()
        };
        self.metrics.set_pending(pending.len() as u64);

        for mut task in pending {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!(node_id = %self.node_id, "worker pool saturated");
                break;
            };
            if self.state.claim_task(task.id, epoch_millis())? == 0 {
                debug!(task_id = task.id, "claim lost to another worker");
                summary.lost += 1;
                continue;
            }
            task.status = TaskStatus::Running;
            task.attempt += 1;
            summary.claimed += 1;

            let processor = self.processor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = processor.process(&task).await {
                    error!(task_id = task.id, error = %e, "failed to record task result");
                }
            });
        }

        self.metrics.set_pending(0);
        if summary.claimed > 0 {
            debug!(node_id = %self.node_id, claimed = summary.claimed, "tasks submitted");
        }
        Ok(summary)
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.parallelism as u32).await {
            drop(all);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.parallelism - self.permits.available_permits()
    }
}
