//! Read-only replica summaries by repository, node, and zone.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use gitgrid_state::{HealthStatus, NodeId, NodeInfo, NodeStatus, RepoId, RepoLocation, Replica};

/// Zone label for nodes that report none, or replicas on unknown nodes.
pub const UNKNOWN_ZONE: &str = "unknown";

/// Replica health and lag aggregated over a group of replicas. Averages
/// and maxima cover only replicas that report the metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LagSummary {
    pub replica_count: usize,
    pub healthy_count: usize,
    pub avg_lag_ms: Option<f64>,
    pub max_lag_ms: Option<u64>,
    pub avg_lag_commits: Option<f64>,
    pub max_lag_commits: Option<u64>,
}

#[derive(Default)]
struct Accumulator {
    replicas: usize,
    healthy: usize,
    lag_ms: Vec<u64>,
    lag_commits: Vec<u64>,
}

impl Accumulator {
    fn add(&mut self, replica: &Replica) {
        self.replicas += 1;
        if replica.health == HealthStatus::Healthy {
            self.healthy += 1;
        }
        self.lag_ms.extend(replica.lag_ms);
        self.lag_commits.extend(replica.lag_commits);
    }

    fn finish(&self) -> LagSummary {
        LagSummary {
            replica_count: self.replicas,
            healthy_count: self.healthy,
            avg_lag_ms: average(&self.lag_ms),
            max_lag_ms: self.lag_ms.iter().copied().max(),
            avg_lag_commits: average(&self.lag_commits),
            max_lag_commits: self.lag_commits.iter().copied().max(),
        }
    }
}

fn average(values: &[u64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<u64>() as f64 / values.len() as f64)
}

impl LagSummary {
    pub fn from_replicas<'a>(replicas: impl IntoIterator<Item = &'a Replica>) -> Self {
        let mut acc = Accumulator::default();
        for replica in replicas {
            acc.add(replica);
        }
        acc.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoSummary {
    pub repo_id: RepoId,
    pub primary_node_id: NodeId,
    #[serde(flatten)]
    pub lag: LagSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node_id: NodeId,
    pub zone: Option<String>,
    pub status: Option<NodeStatus>,
    /// Repositories this node is primary for.
    pub primaries: usize,
    #[serde(flatten)]
    pub lag: LagSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSummary {
    pub zone: String,
    pub nodes: usize,
    pub healthy_nodes: usize,
    #[serde(flatten)]
    pub lag: LagSummary,
}

/// One entry per location, with the repository's replica set.
pub fn by_repository(locations: &[RepoLocation], replicas: &[Replica]) -> Vec<RepoSummary> {
    let mut grouped: HashMap<RepoId, Accumulator> = HashMap::new();
    for replica in replicas {
        grouped.entry(replica.repo_id).or_default().add(replica);
    }
    locations
        .iter()
        .map(|location| RepoSummary {
            repo_id: location.repo_id,
            primary_node_id: location.primary_node_id.clone(),
            lag: grouped
                .get(&location.repo_id)
                .map(Accumulator::finish)
                .unwrap_or_default(),
        })
        .collect()
}

/// One entry per registered node plus any node id that only appears in
/// replica or location rows.
pub fn by_node(nodes: &[NodeInfo], locations: &[RepoLocation], replicas: &[Replica]) -> Vec<NodeSummary> {
    let mut grouped: BTreeMap<&str, (Accumulator, usize)> = BTreeMap::new();
    for node in nodes {
        grouped.entry(node.id.as_str()).or_default();
    }
    for replica in replicas {
        grouped.entry(replica.node_id.as_str()).or_default().0.add(replica);
    }
    for location in locations {
        grouped.entry(location.primary_node_id.as_str()).or_default().1 += 1;
    }

    let by_id: HashMap<&str, &NodeInfo> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    grouped
        .into_iter()
        .map(|(node_id, (acc, primaries))| {
            let node = by_id.get(node_id);
            NodeSummary {
                node_id: node_id.to_string(),
                zone: node.and_then(|n| n.zone.clone()),
                status: node.map(|n| n.status),
                primaries,
                lag: acc.finish(),
            }
        })
        .collect()
}

/// One entry per zone, with replicas attributed to their node's zone.
pub fn by_zone(nodes: &[NodeInfo], replicas: &[Replica]) -> Vec<ZoneSummary> {
    let zone_of: HashMap<&str, &str> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.zone.as_deref().unwrap_or(UNKNOWN_ZONE)))
        .collect();

    let mut grouped: BTreeMap<&str, (Accumulator, usize, usize)> = BTreeMap::new();
    for node in nodes {
        let entry = grouped
            .entry(node.zone.as_deref().unwrap_or(UNKNOWN_ZONE))
            .or_default();
        entry.1 += 1;
        if node.is_healthy() {
            entry.2 += 1;
        }
    }
    for replica in replicas {
        let zone = zone_of
            .get(replica.node_id.as_str())
            .copied()
            .unwrap_or(UNKNOWN_ZONE);
        grouped.entry(zone).or_default().0.add(replica);
    }

    grouped
        .into_iter()
        .map(|(zone, (acc, nodes, healthy_nodes))| ZoneSummary {
            zone: zone.to_string(),
            nodes,
            healthy_nodes,
            lag: acc.finish(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(repo_id: RepoId, node: &str, health: HealthStatus, lag_ms: Option<u64>, lag_commits: Option<u64>) -> Replica {
        Replica {
            repo_id,
            node_id: node.to_string(),
            health,
            lag_ms,
            lag_commits,
            updated_at: 0,
        }
    }

    fn node(id: &str, zone: Option<&str>, status: NodeStatus) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            host: format!("{id}:8080"),
            zone: zone.map(str::to_string),
            region: None,
            status,
            disk_usage_pct: 0.0,
            iops: 0.0,
            repo_count: 0,
            last_heartbeat: 0,
        }
    }

    fn fixture() -> (Vec<NodeInfo>, Vec<RepoLocation>, Vec<Replica>) {
        let nodes = vec![
            node("node-a", Some("us-east-1a"), NodeStatus::Healthy),
            node("node-b", Some("us-east-1a"), NodeStatus::Healthy),
            node("node-c", Some("us-east-1b"), NodeStatus::Unhealthy),
        ];
        let locations = vec![
            RepoLocation::new(1, "node-a", 0),
            RepoLocation::new(2, "node-a", 0),
            RepoLocation::new(3, "node-b", 0),
        ];
        let replicas = vec![
            replica(1, "node-b", HealthStatus::Healthy, Some(10), Some(1)),
            replica(1, "node-c", HealthStatus::Unhealthy, Some(2_000), Some(40)),
            replica(2, "node-b", HealthStatus::Unknown, None, None),
            replica(3, "node-gone", HealthStatus::Healthy, Some(30), None),
        ];
        (nodes, locations, replicas)
    }

    #[test]
    fn lag_summary_skips_unreported_metrics() {
        let (_, _, replicas) = fixture();
        let summary = LagSummary::from_replicas(&replicas[..3]);
        assert_eq!(summary.replica_count, 3);
        assert_eq!(summary.healthy_count, 1);
        assert_eq!(summary.avg_lag_ms, Some(1_005.0));
        assert_eq!(summary.max_lag_ms, Some(2_000));
        assert_eq!(summary.avg_lag_commits, Some(20.5));
        assert_eq!(summary.max_lag_commits, Some(40));

        assert_eq!(LagSummary::from_replicas(std::iter::empty()), LagSummary::default());
    }

    #[test]
    fn per_repository() {
        let (_, locations, replicas) = fixture();
        let summaries = by_repository(&locations, &replicas);
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].lag.replica_count, 2);
        assert_eq!(summaries[1].lag.max_lag_ms, None);
        assert_eq!(summaries[2].primary_node_id, "node-b");
    }

    #[test]
    fn per_node_includes_unregistered() {
        let (nodes, locations, replicas) = fixture();
        let summaries = by_node(&nodes, &locations, &replicas);
        let ids: Vec<&str> = summaries.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["node-a", "node-b", "node-c", "node-gone"]);

        assert_eq!(summaries[0].primaries, 2);
        assert_eq!(summaries[0].lag.replica_count, 0);
        assert_eq!(summaries[1].lag.replica_count, 2);
        assert_eq!(summaries[3].status, None);
    }

    #[test]
    fn per_zone() {
        let (nodes, _, replicas) = fixture();
        let summaries = by_zone(&nodes, &replicas);
        let zones: Vec<&str> = summaries.iter().map(|s| s.zone.as_str()).collect();
        assert_eq!(zones, vec!["unknown", "us-east-1a", "us-east-1b"]);

        let east_a = &summaries[1];
        assert_eq!((east_a.nodes, east_a.healthy_nodes), (2, 2));
        assert_eq!(east_a.lag.replica_count, 2);
        let east_b = &summaries[2];
        assert_eq!((east_b.nodes, east_b.healthy_nodes), (1, 0));
        assert_eq!(summaries[0].lag.replica_count, 1);
    }
}
