//! Dead-letter reprocessing.
//!
//! Each entry is re-inserted as a fresh PENDING task and removed in the same
//! store transaction, so re-running a batch never duplicates work. When the
//! re-insert fails the entry stays put and a notification fires.

use std::sync::Arc;

use tracing::{debug, info, warn};

use gitgrid_notify::{NotificationEvent, Notifier};
use gitgrid_state::{DeadLetterEntry, Requeue, StateStore};

use crate::error::QueueResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprocessSummary {
    pub requeued: usize,
    /// Entries dropped because the pair already had an outstanding task.
    pub coalesced: usize,
    pub failed: usize,
}

enum Attempt {
    Done(Requeue),
    Gone,
    /// Re-insert failed; the entry is kept.
    Failed,
}

pub struct DeadLetterReprocessor {
    state: StateStore,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
}

impl DeadLetterReprocessor {
    pub fn new(state: StateStore, notifier: Arc<dyn Notifier>, batch_size: usize) -> Self {
        Self {
            state,
            notifier,
            batch_size,
        }
    }

    /// Reprocess up to `batch_size` of the oldest entries.
    pub fn reprocess_batch(&self, now: u64) -> QueueResult<ReprocessSummary> {
        let entries = self.state.list_dead_letters(self.batch_size)?;
        let mut summary = ReprocessSummary::default();
        for entry in &entries {
            match self.reprocess_entry(entry, now) {
                Attempt::Done(Requeue::Requeued(_)) => summary.requeued += 1,
                Attempt::Done(Requeue::Coalesced(_)) => summary.coalesced += 1,
                Attempt::Gone => {}
                Attempt::Failed => summary.failed += 1,
            }
        }
        if !entries.is_empty() {
            info!(
                requeued = summary.requeued,
                coalesced = summary.coalesced,
                failed = summary.failed,
                "dead letters reprocessed"
            );
        }
        Ok(summary)
    }

    /// Reprocess one entry by id. `Ok(None)` if it does not exist.
    pub fn reprocess(&self, entry_id: u64, now: u64) -> QueueResult<Option<Requeue>> {
        let Some(entry) = self.state.get_dead_letter(entry_id)? else {
            return Ok(None);
        };
        match self.reprocess_entry(&entry, now) {
            Attempt::Done(result) => Ok(Some(result)),
            Attempt::Gone | Attempt::Failed => Ok(None),
        }
    }

    fn reprocess_entry(&self, entry: &DeadLetterEntry, now: u64) -> Attempt {
        match self.state.requeue_dead_letter(entry.id, now) {
            Ok(Some(result)) => {
                debug!(entry_id = entry.id, repo_id = entry.repo_id, ?result, "dead letter requeued");
                Attempt::Done(result)
            }
            Ok(None) => {
                debug!(entry_id = entry.id, "dead letter already reprocessed");
                Attempt::Gone
            }
            Err(e) => {
                warn!(entry_id = entry.id, repo_id = entry.repo_id, error = %e, "dead letter reprocess failed");
                self.notifier.notify(NotificationEvent::DeadLetterReprocessFailed {
                    entry_id: entry.id,
                    repo_id: entry.repo_id,
                    error: e.to_string(),
                });
                Attempt::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitgrid_notify::NoopNotifier;
    use gitgrid_state::{FailureOutcome, NewTask, TaskStatus};

    fn dead_letter(store: &StateStore, repo_id: u64) -> u64 {
        let id = store
            .enqueue_task(
                &NewTask {
                    repo_id,
                    source_node_id: "node-a".to_string(),
                    target_node_id: "node-b".to_string(),
                    priority: 7,
                },
                0,
            )
            .unwrap()
            .unwrap();
        store.claim_task(id, 1).unwrap();
        match store.fail_task(id, "boom", 1, 2).unwrap() {
            FailureOutcome::DeadLettered { entry_id } => entry_id,
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    fn reprocessor(store: &StateStore, batch: usize) -> DeadLetterReprocessor {
        DeadLetterReprocessor::new(store.clone(), Arc::new(NoopNotifier), batch)
    }

    #[test]
    fn batch_requeues_and_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        dead_letter(&store, 1);
        dead_letter(&store, 2);

        let first = reprocessor(&store, 10).reprocess_batch(100).unwrap();
        assert_eq!(first.requeued, 2);
        assert!(store.list_dead_letters(10).unwrap().is_empty());

        let pending = store.list_tasks(Some(TaskStatus::Pending)).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|t| t.priority == 7 && t.attempt == 0));

        let second = reprocessor(&store, 10).reprocess_batch(200).unwrap();
        assert_eq!(second, ReprocessSummary::default());
        assert_eq!(store.list_tasks(Some(TaskStatus::Pending)).unwrap().len(), 2);
    }

    #[test]
    fn batch_size_is_respected() {
        let store = StateStore::open_in_memory().unwrap();
        for repo_id in 1..=3 {
            dead_letter(&store, repo_id);
        }
        let summary = reprocessor(&store, 2).reprocess_batch(100).unwrap();
        assert_eq!(summary.requeued, 2);
        assert_eq!(store.list_dead_letters(10).unwrap().len(), 1);
    }

    #[test]
    fn single_entry_reprocess() {
        let store = StateStore::open_in_memory().unwrap();
        let entry_id = dead_letter(&store, 1);
        let r = reprocessor(&store, 10);

        assert!(matches!(r.reprocess(entry_id, 100).unwrap(), Some(Requeue::Requeued(_))));
        assert!(r.reprocess(entry_id, 101).unwrap().is_none());
    }
}
