//! Seed provisioner — baseline replication without the autoscaler.
//!
//! Every configured seed node is kept registered and attached as a replica
//! of every repository, existing and new. A seed that is a repository's
//! primary is skipped for that repository.

use std::sync::Arc;

use tracing::{debug, info, warn};

use gitgrid_core::SeedNode;
use gitgrid_queue::Enqueuer;
use gitgrid_routing::NodeRegistry;
use gitgrid_state::{NodeId, RepoId, Replica, StateStore};

use crate::error::CapacityResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionSummary {
    pub repositories: usize,
    pub replicas_attached: usize,
}

pub struct Provisioner {
    state: StateStore,
    registry: Arc<NodeRegistry>,
    enqueuer: Arc<Enqueuer>,
    seeds: Vec<SeedNode>,
    enabled: bool,
}

impl Provisioner {
    pub fn new(
        state: StateStore,
        registry: Arc<NodeRegistry>,
        enqueuer: Arc<Enqueuer>,
        seeds: Vec<SeedNode>,
        enabled: bool,
    ) -> Self {
        Self {
            state,
            registry,
            enqueuer,
            seeds,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.seeds.is_empty()
    }

    /// Create or revive a node row for each seed.
    pub fn ensure_seed_nodes(&self, now: u64) -> CapacityResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        for seed in &self.seeds {
            self.registry.ensure_node(
                &seed.id,
                &seed.host,
                seed.zone.as_deref(),
                seed.region.as_deref(),
                now,
            )?;
        }
        Ok(())
    }

    /// Attach every missing seed to `repo_id` and enqueue its initial copy.
    /// Returns the seeds attached by this call.
    pub async fn provision_repo(&self, repo_id: RepoId, now: u64) -> CapacityResult<Vec<NodeId>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let Some(location) = self.state.get_location(repo_id)? else {
            debug!(repo_id, "no location, nothing to provision");
            return Ok(Vec::new());
        };

        let mut attached = Vec::new();
        for seed in &self.seeds {
            if seed.id == location.primary_node_id {
                continue;
            }
            if self.state.add_replica(&Replica::unknown(repo_id, seed.id.as_str(), now))? {
                attached.push(seed.id.clone());
            }
        }
        if !attached.is_empty() {
            let priority = self.enqueuer.priority_for(repo_id, now).await?;
            self.enqueuer
                .enqueue(repo_id, &location.primary_node_id, &attached, priority, now)?;
            info!(repo_id, seeds = ?attached, "seed replicas attached");
        }
        Ok(attached)
    }

    /// Ensure seed nodes and attach them to every repository.
    pub async fn run_once(&self, now: u64) -> CapacityResult<ProvisionSummary> {
        let mut summary = ProvisionSummary::default();
        if !self.is_enabled() {
            return Ok(summary);
        }
        self.ensure_seed_nodes(now)?;

        for location in self.state.list_locations()? {
            summary.repositories += 1;
            match self.provision_repo(location.repo_id, now).await {
                Ok(attached) => summary.replicas_attached += attached.len(),
                Err(e) => warn!(repo_id = location.repo_id, error = %e, "seed provisioning failed"),
            }
        }
        if summary.replicas_attached > 0 {
            info!(
                repositories = summary.repositories,
                attached = summary.replicas_attached,
                "seed provisioning pass complete"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use gitgrid_metrics::{NoopMetrics, TrafficTracker};
    use gitgrid_queue::PriorityPolicy;
    use gitgrid_state::{HealthStatus, NodeStatus, RepoLocation, TaskStatus};

    fn seed(id: &str) -> SeedNode {
        SeedNode {
            id: id.to_string(),
            host: format!("{id}.internal:8080"),
            zone: Some("us-east-1a".to_string()),
            region: None,
        }
    }

    fn provisioner(store: &StateStore, seeds: Vec<SeedNode>, enabled: bool) -> Provisioner {
        let registry = Arc::new(NodeRegistry::new(store.clone(), Duration::from_secs(60)));
        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            TrafficTracker::new(),
            PriorityPolicy::new(20, 10, 5),
            Arc::new(NoopMetrics),
        ));
        Provisioner::new(store.clone(), registry, enqueuer, seeds, enabled)
    }

    #[tokio::test]
    async fn seeds_attach_to_every_repository_once() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_location(&RepoLocation::new(1, "node-a", 0)).unwrap();
        // Seed-1 is this repository's primary.
        store.put_location(&RepoLocation::new(2, "seed-1", 0)).unwrap();
        let p = provisioner(&store, vec![seed("seed-1"), seed("seed-2")], true);

        let summary = p.run_once(1_000).await.unwrap();
        assert_eq!(summary, ProvisionSummary { repositories: 2, replicas_attached: 3 });

        let node = store.get_node("seed-1").unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Healthy);
        assert_eq!(node.zone.as_deref(), Some("us-east-1a"));

        assert_eq!(store.list_replicas_for_repo(1).unwrap().len(), 2);
        let on_two = store.list_replicas_for_repo(2).unwrap();
        assert_eq!(on_two.len(), 1);
        assert_eq!(on_two[0].node_id, "seed-2");
        assert_eq!(on_two[0].health, HealthStatus::Unknown);
        assert_eq!(store.list_tasks(Some(TaskStatus::Pending)).unwrap().len(), 3);

        let again = p.run_once(2_000).await.unwrap();
        assert_eq!(again.replicas_attached, 0);
        assert_eq!(store.list_tasks(None).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ensure_revives_unhealthy_seed() {
        let store = StateStore::open_in_memory().unwrap();
        let p = provisioner(&store, vec![seed("seed-1")], true);
        p.ensure_seed_nodes(1_000).unwrap();

        let mut node = store.get_node("seed-1").unwrap().unwrap();
        node.status = NodeStatus::Unhealthy;
        store.put_node(&node).unwrap();

        p.ensure_seed_nodes(2_000).unwrap();
        let node = store.get_node("seed-1").unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Healthy);
        assert_eq!(node.last_heartbeat, 2_000);
    }

    #[tokio::test]
    async fn disabled_or_seedless_is_a_no_op() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_location(&RepoLocation::new(1, "node-a", 0)).unwrap();

        let disabled = provisioner(&store, vec![seed("seed-1")], false);
        assert_eq!(disabled.run_once(1_000).await.unwrap(), ProvisionSummary::default());
        assert!(disabled.provision_repo(1, 1_000).await.unwrap().is_empty());

        let seedless = provisioner(&store, Vec::new(), true);
        assert_eq!(seedless.run_once(1_000).await.unwrap(), ProvisionSummary::default());
        assert!(store.list_nodes().unwrap().is_empty());
    }
}
