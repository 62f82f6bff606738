//! Replica selection policies.
//!
//! A policy is a pure function from a replica set and lag bounds to at most
//! one winning replica. Callers pre-filter replicas whose node is missing or
//! unhealthy; the policy itself only looks at replica health and lag.

use gitgrid_core::LagMode;
use gitgrid_state::{HealthStatus, Replica};

/// Maximum tolerated staleness, in both units. Each policy reads the one
/// matching its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagBounds {
    pub max_lag_ms: u64,
    pub max_lag_commits: u64,
}

/// Strategy for choosing the replica that serves a request.
pub trait ReplicaSelectionPolicy: Send + Sync {
    fn mode(&self) -> LagMode;

    /// The replica's lag in this policy's unit; `None` if never reported.
    fn lag_of(&self, replica: &Replica) -> Option<u64>;

    /// The bound in this policy's unit.
    fn bound(&self, bounds: &LagBounds) -> u64;

    /// Pick the healthy replica with the lowest lag within `bounds`.
    /// Ties go to the lowest node id so the choice is deterministic.
    fn select<'a>(&self, replicas: &'a [Replica], bounds: &LagBounds) -> Option<&'a Replica> {
        let max = self.bound(bounds);
        replicas
            .iter()
            .filter(|r| r.health == HealthStatus::Healthy)
            .filter_map(|r| self.lag_of(r).filter(|lag| *lag <= max).map(|lag| (lag, r)))
            .min_by(|(a_lag, a), (b_lag, b)| a_lag.cmp(b_lag).then_with(|| a.node_id.cmp(&b.node_id)))
            .map(|(_, r)| r)
    }
}

/// Lag measured in milliseconds behind the primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeLagPolicy;

impl ReplicaSelectionPolicy for TimeLagPolicy {
    fn mode(&self) -> LagMode {
        LagMode::Time
    }

    fn lag_of(&self, replica: &Replica) -> Option<u64> {
        replica.lag_ms
    }

    fn bound(&self, bounds: &LagBounds) -> u64 {
        bounds.max_lag_ms
    }
}

/// Lag measured in commits behind the primary.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommitLagPolicy;

impl ReplicaSelectionPolicy for CommitLagPolicy {
    fn mode(&self) -> LagMode {
        LagMode::Commits
    }

    fn lag_of(&self, replica: &Replica) -> Option<u64> {
        replica.lag_commits
    }

    fn bound(&self, bounds: &LagBounds) -> u64 {
        bounds.max_lag_commits
    }
}

/// The policy configured for `mode`.
pub fn policy_for(mode: LagMode) -> Box<dyn ReplicaSelectionPolicy> {
    match mode {
        LagMode::Time => Box::new(TimeLagPolicy),
        LagMode::Commits => Box::new(CommitLagPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(node: &str, health: HealthStatus, lag_ms: Option<u64>, lag_commits: Option<u64>) -> Replica {
        Replica {
            repo_id: 1,
            node_id: node.to_string(),
            health,
            lag_ms,
            lag_commits,
            updated_at: 0,
        }
    }

    fn bounds(ms: u64, commits: u64) -> LagBounds {
        LagBounds {
            max_lag_ms: ms,
            max_lag_commits: commits,
        }
    }

    #[test]
    fn time_policy_prefers_lowest_lag_within_bound() {
        let replicas = vec![
            replica("b", HealthStatus::Healthy, Some(50), None),
            replica("c", HealthStatus::Healthy, Some(5_000), None),
            replica("d", HealthStatus::Healthy, Some(5), None),
        ];
        let chosen = TimeLagPolicy.select(&replicas, &bounds(100, 0)).unwrap();
        assert_eq!(chosen.node_id, "d");
    }

    #[test]
    fn nothing_within_bound() {
        let replicas = vec![replica("c", HealthStatus::Healthy, Some(5_000), None)];
        assert!(TimeLagPolicy.select(&replicas, &bounds(100, 0)).is_none());
        assert!(TimeLagPolicy.select(&[], &bounds(100, 0)).is_none());
    }

    #[test]
    fn unhealthy_and_unknown_are_skipped() {
        let replicas = vec![
            replica("b", HealthStatus::Unhealthy, Some(1), None),
            replica("c", HealthStatus::Unknown, Some(1), None),
        ];
        assert!(TimeLagPolicy.select(&replicas, &bounds(100, 0)).is_none());
    }

    #[test]
    fn unreported_lag_never_qualifies() {
        let replicas = vec![replica("b", HealthStatus::Healthy, None, None)];
        assert!(TimeLagPolicy.select(&replicas, &bounds(u64::MAX, u64::MAX)).is_none());
    }

    #[test]
    fn bound_is_inclusive() {
        let replicas = vec![replica("b", HealthStatus::Healthy, Some(100), None)];
        assert!(TimeLagPolicy.select(&replicas, &bounds(100, 0)).is_some());
    }

    #[test]
    fn equal_lag_breaks_tie_by_node_id() {
        let replicas = vec![
            replica("z", HealthStatus::Healthy, Some(10), None),
            replica("a", HealthStatus::Healthy, Some(10), None),
        ];
        assert_eq!(TimeLagPolicy.select(&replicas, &bounds(100, 0)).unwrap().node_id, "a");
    }

    #[test]
    fn commit_policy_reads_commit_lag() {
        let replicas = vec![
            replica("b", HealthStatus::Healthy, Some(1), Some(8)),
            replica("c", HealthStatus::Healthy, Some(9_000), Some(0)),
        ];
        let chosen = CommitLagPolicy.select(&replicas, &bounds(100, 5)).unwrap();
        assert_eq!(chosen.node_id, "c");
    }

    #[test]
    fn policy_for_matches_mode() {
        assert_eq!(policy_for(LagMode::Time).mode(), LagMode::Time);
        assert_eq!(policy_for(LagMode::Commits).mode(), LagMode::Commits);
    }
}
