//! Rebalancer — drains overloaded primaries.
//!
//! For each node over a disk, repo-count or IOPS threshold, a bounded batch
//! of the repositories it is primary for gets a replica on the least-loaded
//! healthy node. When promotion is enabled and that replica is already
//! healthy and caught up, it takes over as primary.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use gitgrid_core::{LagMode, RebalanceConfig};
use gitgrid_placement::least_loaded;
use gitgrid_queue::Enqueuer;
use gitgrid_routing::RoutingEngine;
use gitgrid_state::{
    HealthStatus, NodeInfo, PromotionOutcome, RepoLocation, Replica, StateStore,
};

use crate::error::CapacityResult;

/// True when `node` exceeds any configured threshold.
pub fn is_overloaded(node: &NodeInfo, config: &RebalanceConfig) -> bool {
    node.disk_usage_pct > config.max_disk_usage_pct
        || node.repo_count > config.max_repo_count
        || node.iops > config.max_iops
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceSummary {
    pub overloaded_nodes: Vec<String>,
    pub replicas_added: usize,
    pub promoted: usize,
}

pub struct Rebalancer {
    state: StateStore,
    engine: Arc<RoutingEngine>,
    enqueuer: Arc<Enqueuer>,
    config: RebalanceConfig,
    lag_mode: LagMode,
    enabled: bool,
}

impl Rebalancer {
    pub fn new(
        state: StateStore,
        engine: Arc<RoutingEngine>,
        enqueuer: Arc<Enqueuer>,
        config: RebalanceConfig,
        lag_mode: LagMode,
        enabled: bool,
    ) -> Self {
        Self {
            state,
            engine,
            enqueuer,
            config,
            lag_mode,
            enabled,
        }
    }

    pub async fn run_once(&self, now: u64) -> CapacityResult<RebalanceSummary> {
        let mut summary = RebalanceSummary::default();
        if !self.enabled {
            return Ok(summary);
        }
        let nodes = self.state.list_nodes()?;
        let overloaded: Vec<&NodeInfo> = nodes
            .iter()
            .filter(|n| is_overloaded(n, &self.config))
            .collect();
        if overloaded.is_empty() {
            debug!("no overloaded nodes");
            return Ok(summary);
        }
        // Never move load onto a node that is itself over a threshold.
        let busy: HashSet<&str> = overloaded.iter().map(|n| n.id.as_str()).collect();

        for node in &overloaded {
            info!(
                node_id = %node.id,
                disk_usage_pct = node.disk_usage_pct,
                repo_count = node.repo_count,
                iops = node.iops,
                "node overloaded"
            );
            summary.overloaded_nodes.push(node.id.clone());

            let locations = match self
                .state
                .list_locations_by_primary(&node.id, self.config.batch_size)
            {
                Ok(locations) => locations,
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "failed to list repositories on overloaded node");
                    continue;
                }
            };
            for location in &locations {
                match self.migrate(location, &nodes, &busy, now).await {
                    Ok((added, promoted)) => {
                        summary.replicas_added += added as usize;
                        summary.promoted += promoted as usize;
                    }
                    Err(e) => {
                        warn!(repo_id = location.repo_id, error = %e, "rebalance of repository failed");
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Returns whether a replica was added and whether it was promoted.
    async fn migrate(
        &self,
        location: &RepoLocation,
        nodes: &[NodeInfo],
        busy: &HashSet<&str>,
        now: u64,
    ) -> CapacityResult<(bool, bool)> {
        let repo_id = location.repo_id;
        let mut excluded: HashSet<&str> = busy.iter().copied().collect();
        excluded.insert(location.primary_node_id.as_str());
        let Some(target) = least_loaded(nodes, &excluded) else {
            debug!(repo_id, "no rebalance target available");
            return Ok((false, false));
        };

        let added = self
            .state
            .add_replica(&Replica::unknown(repo_id, target.id.as_str(), now))?;
        if added {
            let priority = self.enqueuer.priority_for(repo_id, now).await?;
            self.enqueuer.enqueue(
                repo_id,
                &location.primary_node_id,
                std::slice::from_ref(&target.id),
                priority,
                now,
            )?;
            info!(repo_id, from = %location.primary_node_id, to = %target.id, "rebalance replica added");
        }

        if !self.config.promote_enabled {
            return Ok((added, false));
        }
        let ready = self
            .state
            .get_replica(repo_id, &target.id)?
            .is_some_and(|r| self.promotion_ready(&r));
        if !ready {
            debug!(repo_id, target = %target.id, "rebalance target not ready for promotion");
            return Ok((added, false));
        }
        let outcome = self
            .engine
            .update_primary(repo_id, &target.id, "rebalancer")
            .await?;
        Ok((added, matches!(outcome, PromotionOutcome::Promoted { .. })))
    }

    /// Healthy, with the lag measure routing uses within the promotion bound.
    fn promotion_ready(&self, replica: &Replica) -> bool {
        if replica.health != HealthStatus::Healthy {
            return false;
        }
        match self.lag_mode {
            LagMode::Time => replica
                .lag_ms
                .is_some_and(|lag| lag <= self.config.promote_max_lag_ms),
            LagMode::Commits => replica
                .lag_commits
                .is_some_and(|lag| lag <= self.config.promote_max_lag_commits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitgrid_metrics::{NoopMetrics, ReplicationCounters, TrafficTracker};
    use gitgrid_notify::NoopNotifier;
    use gitgrid_queue::PriorityPolicy;
    use gitgrid_routing::{RoutingSettings, TimeLagPolicy};
    use gitgrid_state::{NodeStatus, TaskStatus};

    const NOW: u64 = 10_000_000_000;

    fn node(id: &str, repos: u64, disk: f64) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            host: format!("{id}.internal:8080"),
            zone: None,
            region: None,
            status: NodeStatus::Healthy,
            disk_usage_pct: disk,
            iops: 0.0,
            repo_count: repos,
            last_heartbeat: NOW,
        }
    }

    fn config(promote: bool) -> RebalanceConfig {
        RebalanceConfig {
            max_disk_usage_pct: 80.0,
            max_repo_count: 1_000,
            max_iops: 5_000.0,
            batch_size: 10,
            promote_enabled: promote,
            promote_max_lag_ms: 500,
            promote_max_lag_commits: 3,
            ..RebalanceConfig::default()
        }
    }

    fn setup(promote: bool) -> (StateStore, Arc<ReplicationCounters>, Rebalancer) {
        setup_with_mode(promote, LagMode::Time)
    }

    fn setup_with_mode(promote: bool, lag_mode: LagMode) -> (StateStore, Arc<ReplicationCounters>, Rebalancer) {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&node("node-a", 500, 95.0)).unwrap();
        store.put_node(&node("node-b", 300, 40.0)).unwrap();
        store.put_node(&node("node-c", 100, 40.0)).unwrap();
        // Fewest repos but over the disk threshold itself.
        store.put_node(&node("node-d", 10, 90.0)).unwrap();
        for repo_id in 1..=2 {
            store.put_location(&RepoLocation::new(repo_id, "node-a", 0)).unwrap();
        }
        store.put_location(&RepoLocation::new(3, "node-b", 0)).unwrap();

        let counters = Arc::new(ReplicationCounters::new());
        let engine = Arc::new(RoutingEngine::new(
            store.clone(),
            Box::new(TimeLagPolicy),
            RoutingSettings::from_config(&Default::default()),
            counters.clone(),
            Arc::new(NoopNotifier),
        ));
        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            TrafficTracker::new(),
            PriorityPolicy::new(20, 10, 5),
            Arc::new(NoopMetrics),
        ));
        let rebalancer = Rebalancer::new(store.clone(), engine, enqueuer, config(promote), lag_mode, true);
        (store, counters, rebalancer)
    }

    #[test]
    fn any_threshold_marks_overload() {
        let config = config(false);
        assert!(is_overloaded(&node("n", 10, 81.0), &config));
        assert!(is_overloaded(&node("n", 1_001, 10.0), &config));
        let mut busy = node("n", 10, 10.0);
        busy.iops = 6_000.0;
        assert!(is_overloaded(&busy, &config));
        assert!(!is_overloaded(&node("n", 1_000, 80.0), &config));
    }

    #[tokio::test]
    async fn adds_replica_on_least_loaded_node() {
        let (store, _, rebalancer) = setup(false);

        let summary = rebalancer.run_once(NOW).await.unwrap();
        assert_eq!(summary.overloaded_nodes, vec!["node-a".to_string(), "node-d".to_string()]);
        assert_eq!(summary.replicas_added, 2);
        assert_eq!(summary.promoted, 0);

        for repo_id in 1..=2 {
            let replicas = store.list_replicas_for_repo(repo_id).unwrap();
            assert_eq!(replicas.len(), 1);
            assert_eq!(replicas[0].node_id, "node-c");
            assert_eq!(replicas[0].health, HealthStatus::Unknown);
        }
        // Repository 3 is not on an overloaded node.
        assert!(store.list_replicas_for_repo(3).unwrap().is_empty());

        let tasks = store.list_tasks(Some(TaskStatus::Pending)).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.source_node_id == "node-a" && t.target_node_id == "node-c"));

        // Second pass: replicas exist and tasks are outstanding.
        let again = rebalancer.run_once(NOW + 1).await.unwrap();
        assert_eq!(again.replicas_added, 0);
        assert_eq!(store.list_tasks(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn promotes_caught_up_target() {
        let (store, counters, rebalancer) = setup(true);
        let mut ready = Replica::unknown(1, "node-c", NOW);
        ready.health = HealthStatus::Healthy;
        ready.lag_ms = Some(100);
        store.put_replica(&ready).unwrap();
        let mut behind = Replica::unknown(2, "node-c", NOW);
        behind.health = HealthStatus::Healthy;
        behind.lag_ms = Some(10_000);
        store.put_replica(&behind).unwrap();

        let summary = rebalancer.run_once(NOW).await.unwrap();
        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.replicas_added, 0);

        assert_eq!(store.get_location(1).unwrap().unwrap().primary_node_id, "node-c");
        assert_eq!(store.get_location(2).unwrap().unwrap().primary_node_id, "node-a");
        // The old primary is now tracked as a replica.
        let demoted = store.get_replica(1, "node-a").unwrap().unwrap();
        assert_eq!(demoted.health, HealthStatus::Unknown);
        assert_eq!(counters.snapshot().failovers, 1);

        let audit = store.list_audit(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor, "rebalancer");
    }

    #[tokio::test]
    async fn commit_lag_mode_uses_commit_bound() {
        let (store, _, rebalancer) = setup_with_mode(true, LagMode::Commits);
        // Only commit lag reported.
        let mut ready = Replica::unknown(1, "node-c", NOW);
        ready.health = HealthStatus::Healthy;
        ready.lag_commits = Some(2);
        store.put_replica(&ready).unwrap();
        // Time lag is fine but commit lag is over the bound.
        let mut behind = Replica::unknown(2, "node-c", NOW);
        behind.health = HealthStatus::Healthy;
        behind.lag_ms = Some(0);
        behind.lag_commits = Some(40);
        store.put_replica(&behind).unwrap();

        let summary = rebalancer.run_once(NOW).await.unwrap();
        assert_eq!(summary.promoted, 1);
        assert_eq!(store.get_location(1).unwrap().unwrap().primary_node_id, "node-c");
        assert_eq!(store.get_location(2).unwrap().unwrap().primary_node_id, "node-a");
    }

    #[tokio::test]
    async fn disabled_is_a_no_op() {
        let (store, _, _) = setup(false);
        let engine = Arc::new(RoutingEngine::new(
            store.clone(),
            Box::new(TimeLagPolicy),
            RoutingSettings::from_config(&Default::default()),
            Arc::new(NoopMetrics),
            Arc::new(NoopNotifier),
        ));
        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            TrafficTracker::new(),
            PriorityPolicy::new(20, 10, 5),
            Arc::new(NoopMetrics),
        ));
        let rebalancer = Rebalancer::new(store.clone(), engine, enqueuer, config(true), LagMode::Time, false);

        assert_eq!(rebalancer.run_once(NOW).await.unwrap(), RebalanceSummary::default());
        assert!(store.list_replicas().unwrap().is_empty());
    }
}
