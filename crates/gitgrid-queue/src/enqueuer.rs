//! Enqueuer — turns write events into replication tasks.

use std::sync::Arc;

use tracing::{debug, info};

use gitgrid_metrics::{ReplicationMetrics, TrafficTracker};
use gitgrid_state::{NewTask, NodeId, RepoId, StateStore, TaskId};

use crate::error::{QueueError, QueueResult};
use crate::priority::PriorityPolicy;

pub struct Enqueuer {
    state: StateStore,
    traffic: TrafficTracker,
    priority: PriorityPolicy,
    metrics: Arc<dyn ReplicationMetrics>,
}

impl Enqueuer {
    pub fn new(
        state: StateStore,
        traffic: TrafficTracker,
        priority: PriorityPolicy,
        metrics: Arc<dyn ReplicationMetrics>,
    ) -> Self {
        Self {
            state,
            traffic,
            priority,
            metrics,
        }
    }

    /// Insert a PENDING task per target. Targets that already have an
    /// outstanding task for this repository, and the source itself, are
    /// skipped. Returns the ids of the inserted tasks.
    pub fn enqueue(
        &self,
        repo_id: RepoId,
        source: &str,
        targets: &[NodeId],
        priority: u8,
        now: u64,
    ) -> QueueResult<Vec<TaskId>> {
        let mut inserted = Vec::new();
        for target in targets {
            if target == source {
                continue;
            }
            let task = NewTask {
                repo_id,
                source_node_id: source.to_string(),
                target_node_id: target.clone(),
                priority,
            };
            match self.state.enqueue_task(&task, now)? {
                Some(id) => inserted.push(id),
                None => debug!(repo_id, target = %target, "task already outstanding, coalesced"),
            }
        }
        if !inserted.is_empty() {
            self.metrics.record_enqueued(inserted.len() as u64);
            debug!(repo_id, %source, priority, count = inserted.len(), "replication tasks enqueued");
        }
        Ok(inserted)
    }

    /// Priority for `repo_id` from its last commit and current read traffic.
    pub async fn priority_for(&self, repo_id: RepoId, now: u64) -> QueueResult<u8> {
        let last_commit_at = self
            .state
            .get_repository(repo_id)?
            .and_then(|r| r.last_commit_at);
        let reads = self.traffic.read_count(repo_id).await;
        Ok(self.priority.compute(last_commit_at, reads, now))
    }

    /// Handle a completed write: replicate from the primary to every
    /// replica of the repository.
    pub async fn on_push(&self, repo_id: RepoId, now: u64) -> QueueResult<Vec<TaskId>> {
        let location = self
            .state
            .get_location(repo_id)?
            .ok_or(QueueError::LocationMissing(repo_id))?;
        let targets: Vec<NodeId> = self
            .state
            .list_replicas_for_repo(repo_id)?
            .into_iter()
            .map(|r| r.node_id)
            .collect();
        if targets.is_empty() {
            debug!(repo_id, "push on repository without replicas");
            return Ok(Vec::new());
        }
        let priority = self.priority_for(repo_id, now).await?;
        let inserted = self.enqueue(repo_id, &location.primary_node_id, &targets, priority, now)?;
        info!(
            repo_id,
            primary = %location.primary_node_id,
            replicas = targets.len(),
            enqueued = inserted.len(),
            priority,
            "push fanned out"
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitgrid_metrics::ReplicationCounters;
    use gitgrid_state::{RepoLocation, Replica, RepositoryInfo, TaskStatus};

    const NOW: u64 = 10_000_000_000;

    fn setup() -> (StateStore, TrafficTracker, Arc<ReplicationCounters>, Enqueuer) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_repository(&RepositoryInfo {
                id: 1,
                owner: "octo".to_string(),
                name: "hello".to_string(),
                stars: 0,
                watchers: 0,
                last_commit_at: Some(NOW - 1_000),
                created_at: 0,
            })
            .unwrap();
        store.put_location(&RepoLocation::new(1, "node-a", 0)).unwrap();
        store
            .replace_replicas(1, &[Replica::unknown(1, "node-b", 0), Replica::unknown(1, "node-c", 0)])
            .unwrap();
        let traffic = TrafficTracker::new();
        let counters = Arc::new(ReplicationCounters::new());
        let enqueuer = Enqueuer::new(
            store.clone(),
            traffic.clone(),
            PriorityPolicy::new(20, 10, 5),
            counters.clone(),
        );
        (store, traffic, counters, enqueuer)
    }

    #[tokio::test]
    async fn push_enqueues_one_task_per_replica() {
        let (store, traffic, counters, enqueuer) = setup();
        for _ in 0..25 {
            traffic.record(1).await;
        }

        let ids = enqueuer.on_push(1, NOW).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(counters.snapshot().enqueued, 2);

        let tasks = store.list_tasks(Some(TaskStatus::Pending)).unwrap();
        assert!(tasks.iter().all(|t| t.source_node_id == "node-a"));
        // Fresh commit (10) + 25 reads / 10 (2).
        assert!(tasks.iter().all(|t| t.priority == 12));
    }

    #[tokio::test]
    async fn repeated_pushes_coalesce() {
        let (store, _, counters, enqueuer) = setup();
        enqueuer.on_push(1, NOW).await.unwrap();
        let second = enqueuer.on_push(1, NOW + 1).await.unwrap();

        assert!(second.is_empty());
        assert_eq!(store.list_tasks(None).unwrap().len(), 2);
        assert_eq!(counters.snapshot().enqueued, 2);
    }

    #[tokio::test]
    async fn push_without_location_is_an_error() {
        let (_, _, _, enqueuer) = setup();
        assert!(matches!(
            enqueuer.on_push(99, NOW).await,
            Err(QueueError::LocationMissing(99))
        ));
    }

    #[test]
    fn enqueue_skips_source_as_target() {
        let (store, _, _, enqueuer) = setup();
        let ids = enqueuer
            .enqueue(1, "node-a", &["node-a".to_string(), "node-d".to_string()], 3, NOW)
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.get_task(ids[0]).unwrap().unwrap().target_node_id, "node-d");
    }
}
