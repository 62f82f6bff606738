//! Autoscaler — popularity-driven replica counts.
//!
//! Each pass drains the traffic tracker, derives a desired replica count
//! per repository from read traffic, stars and watchers, and adds (or, when
//! enabled, removes) replicas to match. New replicas get a PENDING task from
//! the primary so the copy is populated before it can qualify for reads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use gitgrid_core::AutoscaleConfig;
use gitgrid_metrics::TrafficTracker;
use gitgrid_placement::{rank_candidates, removal_order};
use gitgrid_queue::Enqueuer;
use gitgrid_state::{NodeId, NodeInfo, RepoId, RepoLocation, Replica, StateStore};

use crate::error::CapacityResult;

/// A scaling decision for a single repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add this many replicas.
    Grow(u32),
    /// Remove this many replicas.
    Shrink(u32),
    NoChange,
}

/// What one repository's evaluation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleAction {
    pub repo_id: RepoId,
    pub current: u32,
    pub desired: u32,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

/// Number of thresholds `value` meets or exceeds.
fn step_boost(value: u64, thresholds: &[u64]) -> u32 {
    thresholds.iter().filter(|t| value >= **t).count() as u32
}

/// `min_replicas` plus one step per crossed threshold across the three
/// signals, clamped to `[min_replicas, max_replicas]`.
pub fn desired_replicas(config: &AutoscaleConfig, traffic: u64, stars: u64, watchers: u64) -> u32 {
    let boost = step_boost(traffic, &config.traffic_thresholds)
        + step_boost(stars, &config.star_thresholds)
        + step_boost(watchers, &config.watcher_thresholds);
    let max = config.max_replicas.max(config.min_replicas);
    config.min_replicas.saturating_add(boost).clamp(config.min_replicas, max)
}

/// Compare the desired count against the current one.
pub fn decide(current: u32, desired: u32, scale_down_enabled: bool) -> ScaleDecision {
    if desired > current {
        ScaleDecision::Grow(desired - current)
    } else if desired < current && scale_down_enabled {
        ScaleDecision::Shrink(current - desired)
    } else {
        ScaleDecision::NoChange
    }
}

pub struct Autoscaler {
    state: StateStore,
    traffic: TrafficTracker,
    enqueuer: Arc<Enqueuer>,
    config: AutoscaleConfig,
    enabled: bool,
}

impl Autoscaler {
    pub fn new(
        state: StateStore,
        traffic: TrafficTracker,
        enqueuer: Arc<Enqueuer>,
        config: AutoscaleConfig,
        enabled: bool,
    ) -> Self {
        Self {
            state,
            traffic,
            enqueuer,
            config,
            enabled,
        }
    }

    /// Evaluate every repository with a location. Returns the repositories
    /// whose replica set changed.
    pub async fn run_once(&self, now: u64) -> CapacityResult<Vec<ScaleAction>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let traffic = self.traffic.snapshot_and_reset().await;
        let nodes = self.state.list_nodes()?;
        let locations = self.state.list_locations()?;

        let mut actions = Vec::new();
        for location in &locations {
            let reads = traffic.get(&location.repo_id).copied().unwrap_or(0);
            match self.evaluate(location, reads, &nodes, now).await {
                Ok(action) if !action.added.is_empty() || !action.removed.is_empty() => {
                    actions.push(action)
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(repo_id = location.repo_id, error = %e, "autoscale evaluation failed");
                }
            }
        }
        if !actions.is_empty() {
            info!(repos = actions.len(), "autoscale pass changed replica sets");
        }
        Ok(actions)
    }

    /// Evaluate one repository against `reads` drained from the tracker.
    pub async fn evaluate(
        &self,
        location: &RepoLocation,
        reads: u64,
        nodes: &[NodeInfo],
        now: u64,
    ) -> CapacityResult<ScaleAction> {
        let repo_id = location.repo_id;
        let (stars, watchers) = self
            .state
            .get_repository(repo_id)?
            .map(|r| (r.stars, r.watchers))
            .unwrap_or((0, 0));
        let replicas = self.state.list_replicas_for_repo(repo_id)?;
        let current = replicas.len() as u32;
        let desired = desired_replicas(&self.config, reads, stars, watchers);

        let mut action = ScaleAction {
            repo_id,
            current,
            desired,
            added: Vec::new(),
            removed: Vec::new(),
        };
        let primary = nodes.iter().find(|n| n.id == location.primary_node_id);

        match decide(current, desired, self.config.scale_down_enabled) {
            ScaleDecision::Grow(count) => {
                let mut excluded: HashSet<&str> =
                    replicas.iter().map(|r| r.node_id.as_str()).collect();
                excluded.insert(location.primary_node_id.as_str());
                let candidates =
                    rank_candidates(nodes, &excluded, primary, self.config.zone_preference);
                if candidates.len() < count as usize {
                    debug!(repo_id, wanted = count, available = candidates.len(), "not enough placement candidates");
                }
                for candidate in candidates.into_iter().take(count as usize) {
                    if self.state.add_replica(&Replica::unknown(repo_id, candidate.node_id.as_str(), now))? {
                        action.added.push(candidate.node_id);
                    }
                }
                if !action.added.is_empty() {
                    let priority = self.enqueuer.priority_for(repo_id, now).await?;
                    self.enqueuer.enqueue(
                        repo_id,
                        &location.primary_node_id,
                        &action.added,
                        priority,
                        now,
                    )?;
                    info!(repo_id, current, desired, added = ?action.added, "replicas scaled up");
                }
            }
            ScaleDecision::Shrink(count) => {
                let by_id: HashMap<&str, &NodeInfo> =
                    nodes.iter().map(|n| (n.id.as_str(), n)).collect();
                // Rows pointing at unregistered nodes go first.
                let (known, unknown): (Vec<&Replica>, Vec<&Replica>) = replicas
                    .iter()
                    .partition(|r| by_id.contains_key(r.node_id.as_str()));
                let known_nodes: Vec<NodeInfo> = known
                    .iter()
                    .filter_map(|r| by_id.get(r.node_id.as_str()).map(|n| (*n).clone()))
                    .collect();
                let order = unknown
                    .iter()
                    .map(|r| r.node_id.clone())
                    .chain(removal_order(&known_nodes, primary, self.config.zone_preference));
                for node_id in order.take(count as usize) {
                    if self.state.remove_replica(repo_id, &node_id)? {
                        action.removed.push(node_id);
                    }
                }
                if !action.removed.is_empty() {
                    info!(repo_id, current, desired, removed = ?action.removed, "replicas scaled down");
                }
            }
            ScaleDecision::NoChange => {
                debug!(repo_id, current, desired, "replica count unchanged");
            }
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitgrid_metrics::NoopMetrics;
    use gitgrid_queue::PriorityPolicy;
    use gitgrid_state::{NodeStatus, RepositoryInfo, TaskStatus};

    const NOW: u64 = 10_000_000_000;

    fn config(scale_down: bool) -> AutoscaleConfig {
        AutoscaleConfig {
            min_replicas: 1,
            max_replicas: 3,
            traffic_thresholds: vec![20, 100, 300],
            star_thresholds: vec![50],
            watcher_thresholds: vec![10],
            scale_down_enabled: scale_down,
            ..AutoscaleConfig::default()
        }
    }

    fn node(id: &str, zone: &str, repos: u64) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            host: format!("{id}.internal:8080"),
            zone: Some(zone.to_string()),
            region: Some("us-east-1".to_string()),
            status: NodeStatus::Healthy,
            disk_usage_pct: 10.0,
            iops: 0.0,
            repo_count: repos,
            last_heartbeat: NOW,
        }
    }

    fn setup(scale_down: bool) -> (StateStore, TrafficTracker, Autoscaler) {
        let store = StateStore::open_in_memory().unwrap();
        for n in [
            node("node-a", "us-east-1a", 10),
            node("node-b", "us-east-1a", 30),
            node("node-c", "us-east-1b", 5),
            node("node-d", "us-east-1a", 20),
        ] {
            store.put_node(&n).unwrap();
        }
        store
            .put_repository(&RepositoryInfo {
                id: 1,
                owner: "acme".to_string(),
                name: "widgets".to_string(),
                stars: 0,
                watchers: 0,
                last_commit_at: None,
                created_at: 0,
            })
            .unwrap();
        store.put_location(&RepoLocation::new(1, "node-a", 0)).unwrap();

        let traffic = TrafficTracker::new();
        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            traffic.clone(),
            PriorityPolicy::new(20, 10, 5),
            Arc::new(NoopMetrics),
        ));
        let scaler = Autoscaler::new(store.clone(), traffic.clone(), enqueuer, config(scale_down), true);
        (store, traffic, scaler)
    }

    #[test]
    fn thresholds_step_and_clamp() {
        let config = config(false);
        assert_eq!(desired_replicas(&config, 0, 0, 0), 1);
        assert_eq!(desired_replicas(&config, 20, 0, 0), 2);
        // Two thresholds crossed.
        assert_eq!(desired_replicas(&config, 150, 0, 0), 3);
        // Three crossed, clamped to max.
        assert_eq!(desired_replicas(&config, 500, 0, 0), 3);
        assert_eq!(desired_replicas(&config, 0, 50, 10), 3);
    }

    #[test]
    fn decision_respects_scale_down_flag() {
        assert_eq!(decide(1, 3, false), ScaleDecision::Grow(2));
        assert_eq!(decide(3, 1, false), ScaleDecision::NoChange);
        assert_eq!(decide(3, 1, true), ScaleDecision::Shrink(2));
        assert_eq!(decide(2, 2, true), ScaleDecision::NoChange);
    }

    #[tokio::test]
    async fn grows_by_affinity_then_load() {
        let (store, traffic, scaler) = setup(false);
        for _ in 0..150 {
            traffic.record(1).await;
        }

        let actions = scaler.run_once(NOW).await.unwrap();
        assert_eq!(actions.len(), 1);
        // Same zone first (d before b by load), then same region. Never the
        // primary.
        assert_eq!(
            actions[0].added,
            vec!["node-d".to_string(), "node-b".to_string(), "node-c".to_string()]
        );
        assert_eq!(actions[0].desired, 3);

        let tasks = store.list_tasks(Some(TaskStatus::Pending)).unwrap();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.source_node_id == "node-a"));
        // Traffic was drained by the pass.
        assert!(traffic.snapshot_and_reset().await.is_empty());
    }

    #[tokio::test]
    async fn scale_down_disabled_leaves_replicas() {
        let (store, _, scaler) = setup(false);
        for id in ["node-b", "node-c", "node-d"] {
            store.add_replica(&Replica::unknown(1, id, 0)).unwrap();
        }

        let actions = scaler.run_once(NOW).await.unwrap();
        assert!(actions.is_empty());
        assert_eq!(store.list_replicas_for_repo(1).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn scale_down_removes_least_preferred_first() {
        let (store, _, scaler) = setup(true);
        for id in ["node-b", "node-c", "node-d", "node-gone"] {
            store.add_replica(&Replica::unknown(1, id, 0)).unwrap();
        }

        let actions = scaler.run_once(NOW).await.unwrap();
        // Unregistered node, then the other-zone node, then the busier
        // same-zone node.
        assert_eq!(
            actions[0].removed,
            vec!["node-gone".to_string(), "node-c".to_string(), "node-b".to_string()]
        );
        let left: Vec<String> = store
            .list_replicas_for_repo(1)
            .unwrap()
            .into_iter()
            .map(|r| r.node_id)
            .collect();
        assert_eq!(left, vec!["node-d".to_string()]);
    }

    #[tokio::test]
    async fn disabled_is_a_no_op() {
        let (store, traffic, _) = setup(true);
        let enqueuer = Arc::new(Enqueuer::new(
            store.clone(),
            traffic.clone(),
            PriorityPolicy::new(20, 10, 5),
            Arc::new(NoopMetrics),
        ));
        let scaler = Autoscaler::new(store.clone(), traffic.clone(), enqueuer, config(true), false);
        for _ in 0..500 {
            traffic.record(1).await;
        }
        assert!(scaler.run_once(NOW).await.unwrap().is_empty());
        assert!(store.list_replicas_for_repo(1).unwrap().is_empty());
        // Counters untouched while disabled.
        assert_eq!(traffic.read_count(1).await, 500);
    }
}
