//! Task processor — runs a claimed task and records the result.

use std::sync::Arc;

use tracing::{info, warn};

use gitgrid_metrics::ReplicationMetrics;
use gitgrid_state::{FailureOutcome, ReplicationTask, StateStore, epoch_millis};

use crate::error::QueueResult;
use crate::executor::SyncExecutor;

/// Where a task ended up after one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Failed, back to PENDING for another attempt.
    Retried,
    /// Failed with the retry budget spent.
    DeadLettered { entry_id: u64 },
    /// The task was no longer RUNNING when the result arrived.
    Stale,
}

pub struct TaskProcessor {
    state: StateStore,
    executor: Arc<dyn SyncExecutor>,
    metrics: Arc<dyn ReplicationMetrics>,
    max_attempts: u32,
}

impl TaskProcessor {
    pub fn new(
        state: StateStore,
        executor: Arc<dyn SyncExecutor>,
        metrics: Arc<dyn ReplicationMetrics>,
        max_attempts: u32,
    ) -> Self {
        Self {
            state,
            executor,
            metrics,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Execute a RUNNING task and move it to its next state.
    pub async fn process(&self, task: &ReplicationTask) -> QueueResult<ProcessOutcome> {
        let result = self.executor.execute(task).await;
        let now = epoch_millis();

        let error = match result {
            Ok(()) => {
                if !self.state.complete_task(task.id, now)? {
                    return Ok(ProcessOutcome::Stale);
                }
                self.metrics.record_task_succeeded();
                info!(
                    task_id = task.id,
                    repo_id = task.repo_id,
                    target = %task.target_node_id,
                    "replication task completed"
                );
                return Ok(ProcessOutcome::Completed);
            }
            Err(e) => format!("{e:#}"),
        };

        self.metrics.record_task_failed();
        let outcome = match self.state.fail_task(task.id, &error, self.max_attempts, now)? {
            FailureOutcome::Retried => {
                warn!(task_id = task.id, repo_id = task.repo_id, attempt = task.attempt, %error, "replication task failed, will retry");
                ProcessOutcome::Retried
            }
            FailureOutcome::DeadLettered { entry_id } => {
                self.metrics.record_dead_lettered();
                warn!(task_id = task.id, repo_id = task.repo_id, entry_id, %error, "replication task dead-lettered");
                ProcessOutcome::DeadLettered { entry_id }
            }
            FailureOutcome::Ignored => ProcessOutcome::Stale,
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use gitgrid_metrics::ReplicationCounters;
    use gitgrid_state::{NewTask, TaskStatus};

    use crate::executor::BoxFuture;

    /// Fails the first `failures` executions, then succeeds.
    struct FlakyExecutor {
        failures: u32,
        calls: AtomicU32,
    }

    impl SyncExecutor for FlakyExecutor {
        fn execute<'a>(&'a self, _task: &'a ReplicationTask) -> BoxFuture<'a> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    anyhow::bail!("exit status 128: remote hung up");
                }
                Ok(())
            })
        }
    }

    fn setup(failures: u32, max_attempts: u32) -> (StateStore, Arc<ReplicationCounters>, TaskProcessor, u64) {
        let store = StateStore::open_in_memory().unwrap();
        let id = store
            .enqueue_task(
                &NewTask {
                    repo_id: 1,
                    source_node_id: "node-a".to_string(),
                    target_node_id: "node-b".to_string(),
                    priority: 5,
                },
                0,
            )
            .unwrap()
            .unwrap();
        let counters = Arc::new(ReplicationCounters::new());
        let executor = Arc::new(FlakyExecutor {
            failures,
            calls: AtomicU32::new(0),
        });
        let processor = TaskProcessor::new(store.clone(), executor, counters.clone(), max_attempts);
        (store, counters, processor, id)
    }

    async fn claim_and_process(store: &StateStore, processor: &TaskProcessor, id: u64) -> ProcessOutcome {
        assert_eq!(store.claim_task(id, 1).unwrap(), 1);
        let task = store.get_task(id).unwrap().unwrap();
        processor.process(&task).await.unwrap()
    }

    #[tokio::test]
    async fn success_marks_done() {
        let (store, counters, processor, id) = setup(0, 3);
        assert_eq!(claim_and_process(&store, &processor, id).await, ProcessOutcome::Completed);
        assert_eq!(store.get_task(id).unwrap().unwrap().status, TaskStatus::Done);
        assert_eq!(counters.snapshot().succeeded, 1);
    }

    #[tokio::test]
    async fn failure_retries_then_succeeds() {
        let (store, counters, processor, id) = setup(1, 3);
        assert_eq!(claim_and_process(&store, &processor, id).await, ProcessOutcome::Retried);
        let task = store.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.last_error.unwrap().contains("remote hung up"));

        assert_eq!(claim_and_process(&store, &processor, id).await, ProcessOutcome::Completed);
        let snap = counters.snapshot();
        assert_eq!((snap.failed, snap.succeeded), (1, 1));
    }

    #[tokio::test]
    async fn budget_exhaustion_dead_letters() {
        let (store, counters, processor, id) = setup(10, 2);
        assert_eq!(claim_and_process(&store, &processor, id).await, ProcessOutcome::Retried);
        let outcome = claim_and_process(&store, &processor, id).await;
        assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));

        assert_eq!(store.get_task(id).unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(store.list_dead_letters(10).unwrap().len(), 1);
        assert_eq!(counters.snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn result_for_requeued_task_is_stale() {
        let (store, _, processor, id) = setup(0, 3);
        store.claim_task(id, 1).unwrap();
        let task = store.get_task(id).unwrap().unwrap();
        // The reconciler gave the task back to the queue meanwhile.
        store.requeue_stale_running(u64::MAX, 2).unwrap();

        assert_eq!(processor.process(&task).await.unwrap(), ProcessOutcome::Stale);
    }
}
