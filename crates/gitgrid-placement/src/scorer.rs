//! Node scoring for replica placement.
//!
//! Candidates are ordered by:
//! - **Affinity tier**: closeness to the primary under the configured
//!   zone preference (lower is better)
//! - **Load score**: `repo_count + disk_usage_pct + 0.1 * iops` (lower is
//!   better)

use std::cmp::Ordering;
use std::collections::HashSet;

use gitgrid_core::ZonePreference;
use gitgrid_state::NodeInfo;

/// How close a candidate sits to the primary. Ordered best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AffinityTier {
    Preferred,
    Nearby,
    Any,
}

/// Scored placement candidate.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub node_id: String,
    pub tier: AffinityTier,
    pub load_score: f64,
}

impl CandidateScore {
    fn cmp_rank(&self, other: &Self) -> Ordering {
        self.tier
            .cmp(&other.tier)
            .then_with(|| {
                self.load_score
                    .partial_cmp(&other.load_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

/// Composite load of a node; lower means more room.
pub fn load_score(node: &NodeInfo) -> f64 {
    node.repo_count as f64 + node.disk_usage_pct + 0.1 * node.iops
}

fn same(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

/// Tier of `candidate` relative to `primary`.
///
/// With `SameZone`: same zone, then same region, then anything. With
/// `SameRegion`: same region, then anything. With `Any`, or when the primary
/// is unknown, every node shares one tier.
pub fn affinity_tier(
    candidate: &NodeInfo,
    primary: Option<&NodeInfo>,
    preference: ZonePreference,
) -> AffinityTier {
    let Some(primary) = primary else {
        return AffinityTier::Preferred;
    };
    let same_zone = same(&candidate.zone, &primary.zone);
    let same_region = same(&candidate.region, &primary.region);
    match preference {
        ZonePreference::SameZone if same_zone => AffinityTier::Preferred,
        ZonePreference::SameZone if same_region => AffinityTier::Nearby,
        ZonePreference::SameZone => AffinityTier::Any,
        ZonePreference::SameRegion if same_region => AffinityTier::Preferred,
        ZonePreference::SameRegion => AffinityTier::Nearby,
        ZonePreference::Any => AffinityTier::Preferred,
    }
}

/// Rank healthy nodes not in `excluded`, best target first.
pub fn rank_candidates(
    nodes: &[NodeInfo],
    excluded: &HashSet<&str>,
    primary: Option<&NodeInfo>,
    preference: ZonePreference,
) -> Vec<CandidateScore> {
    let mut scores: Vec<CandidateScore> = nodes
        .iter()
        .filter(|n| n.is_healthy() && !excluded.contains(n.id.as_str()))
        .map(|n| CandidateScore {
            node_id: n.id.clone(),
            tier: affinity_tier(n, primary, preference),
            load_score: load_score(n),
        })
        .collect();
    scores.sort_by(CandidateScore::cmp_rank);
    scores
}

/// Order replica nodes for removal: the reverse of the add ranking, so the
/// least preferred and most loaded go first. Health is not considered.
pub fn removal_order(
    replica_nodes: &[NodeInfo],
    primary: Option<&NodeInfo>,
    preference: ZonePreference,
) -> Vec<String> {
    let mut scores: Vec<CandidateScore> = replica_nodes
        .iter()
        .map(|n| CandidateScore {
            node_id: n.id.clone(),
            tier: affinity_tier(n, primary, preference),
            load_score: load_score(n),
        })
        .collect();
    scores.sort_by(|a, b| b.cmp_rank(a));
    scores.into_iter().map(|s| s.node_id).collect()
}

/// The healthy node not in `excluded` hosting the fewest repositories.
pub fn least_loaded<'a>(nodes: &'a [NodeInfo], excluded: &HashSet<&str>) -> Option<&'a NodeInfo> {
    nodes
        .iter()
        .filter(|n| n.is_healthy() && !excluded.contains(n.id.as_str()))
        .min_by(|a, b| a.repo_count.cmp(&b.repo_count).then_with(|| a.id.cmp(&b.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitgrid_state::NodeStatus;

    fn test_node(id: &str, zone: &str, region: &str, repos: u64, disk: f64, iops: f64) -> NodeInfo {
        NodeInfo {
            id: id.to_string(),
            host: format!("{id}:8443"),
            zone: Some(zone.to_string()),
            region: Some(region.to_string()),
            status: NodeStatus::Healthy,
            disk_usage_pct: disk,
            iops,
            repo_count: repos,
            last_heartbeat: 0,
        }
    }

    fn ids(scores: &[CandidateScore]) -> Vec<&str> {
        scores.iter().map(|s| s.node_id.as_str()).collect()
    }

    #[test]
    fn load_score_formula() {
        let node = test_node("a", "z", "r", 10, 40.0, 500.0);
        assert!((load_score(&node) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn same_zone_preference_orders_by_tier_then_load() {
        let primary = test_node("p", "use1-a", "use1", 0, 0.0, 0.0);
        let nodes = vec![
            test_node("far", "euw1-a", "euw1", 0, 0.0, 0.0),
            test_node("region", "use1-b", "use1", 0, 0.0, 0.0),
            test_node("zone-busy", "use1-a", "use1", 50, 80.0, 0.0),
            test_node("zone-idle", "use1-a", "use1", 1, 5.0, 0.0),
        ];
        let ranked = rank_candidates(&nodes, &HashSet::new(), Some(&primary), ZonePreference::SameZone);
        assert_eq!(ids(&ranked), vec!["zone-idle", "zone-busy", "region", "far"]);
    }

    #[test]
    fn same_region_preference_merges_zones() {
        let primary = test_node("p", "use1-a", "use1", 0, 0.0, 0.0);
        let nodes = vec![
            test_node("zone", "use1-a", "use1", 30, 0.0, 0.0),
            test_node("region", "use1-b", "use1", 10, 0.0, 0.0),
            test_node("far", "euw1-a", "euw1", 0, 0.0, 0.0),
        ];
        let ranked = rank_candidates(&nodes, &HashSet::new(), Some(&primary), ZonePreference::SameRegion);
        assert_eq!(ids(&ranked), vec!["region", "zone", "far"]);
    }

    #[test]
    fn any_preference_is_pure_load() {
        let primary = test_node("p", "use1-a", "use1", 0, 0.0, 0.0);
        let nodes = vec![
            test_node("zone", "use1-a", "use1", 30, 0.0, 0.0),
            test_node("far", "euw1-a", "euw1", 0, 0.0, 0.0),
        ];
        let ranked = rank_candidates(&nodes, &HashSet::new(), Some(&primary), ZonePreference::Any);
        assert_eq!(ids(&ranked), vec!["far", "zone"]);
    }

    #[test]
    fn excluded_and_unhealthy_are_filtered() {
        let mut sick = test_node("sick", "z", "r", 0, 0.0, 0.0);
        sick.status = NodeStatus::Unhealthy;
        let nodes = vec![
            sick,
            test_node("primary", "z", "r", 0, 0.0, 0.0),
            test_node("ok", "z", "r", 5, 0.0, 0.0),
        ];
        let excluded: HashSet<&str> = ["primary"].into_iter().collect();
        let ranked = rank_candidates(&nodes, &excluded, None, ZonePreference::SameZone);
        assert_eq!(ids(&ranked), vec!["ok"]);
    }

    #[test]
    fn removal_order_is_reverse_ranking() {
        let primary = test_node("p", "use1-a", "use1", 0, 0.0, 0.0);
        let replicas = vec![
            test_node("zone-idle", "use1-a", "use1", 1, 0.0, 0.0),
            test_node("far", "euw1-a", "euw1", 0, 0.0, 0.0),
            test_node("zone-busy", "use1-a", "use1", 90, 0.0, 0.0),
        ];
        let order = removal_order(&replicas, Some(&primary), ZonePreference::SameZone);
        assert_eq!(order, vec!["far", "zone-busy", "zone-idle"]);
    }

    #[test]
    fn least_loaded_by_repo_count() {
        let nodes = vec![
            test_node("a", "z", "r", 10, 0.0, 0.0),
            test_node("b", "z", "r", 2, 99.0, 0.0),
            test_node("c", "z", "r", 5, 0.0, 0.0),
        ];
        let excluded: HashSet<&str> = HashSet::new();
        assert_eq!(least_loaded(&nodes, &excluded).unwrap().id, "b");

        let excluded: HashSet<&str> = ["b"].into_iter().collect();
        assert_eq!(least_loaded(&nodes, &excluded).unwrap().id, "c");
        assert!(least_loaded(&[], &excluded).is_none());
    }
}
