//! Legacy replica backfill.
//!
//! Older locations carried their replica set denormalized in three JSON
//! side columns:
//!
//! - `legacy_replicas`: `["node-b", "node-c"]`
//! - `legacy_replica_health`: `{"node-b": "healthy", "node-c": "degraded"}`
//! - `legacy_replica_lag`: `{"node-b": 120}` (milliseconds)
//!
//! The backfill materializes those into replica rows. Rows that already
//! exist are left alone, so re-running after migration inserts nothing.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use gitgrid_state::{HealthStatus, RepoLocation, Replica, StateStore};

use crate::error::CapacityResult;

/// What one run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub locations_scanned: usize,
    pub legacy_locations: usize,
    pub rows_inserted: usize,
    /// Legacy entries naming the current primary.
    pub skipped_primary: usize,
    pub parse_errors: usize,
}

/// Migration progress: replicas named by legacy columns versus rows present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillStats {
    pub legacy_locations: usize,
    pub expected_replicas: usize,
    pub actual_replicas: usize,
    pub missing_replicas: usize,
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(raw: Option<&str>) -> Result<T, String> {
    match raw.map(str::trim) {
        None | Some("") => Ok(T::default()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| e.to_string()),
    }
}

/// Replica rows encoded in `location`'s legacy columns, primary excluded.
pub fn legacy_replicas(location: &RepoLocation, now: u64) -> Result<Vec<Replica>, String> {
    let nodes: Vec<String> = parse_json(location.legacy_replicas.as_deref())?;
    let health: HashMap<String, String> = parse_json(location.legacy_replica_health.as_deref())?;
    let lag: HashMap<String, u64> = parse_json(location.legacy_replica_lag.as_deref())?;

    let mut replicas: Vec<Replica> = nodes
        .into_iter()
        .filter(|n| !n.is_empty() && *n != location.primary_node_id)
        .map(|node_id| {
            let mut replica = Replica::unknown(location.repo_id, node_id.as_str(), now);
            if let Some(h) = health.get(&node_id) {
                replica.health = HealthStatus::parse_lenient(h);
            }
            replica.lag_ms = lag.get(&node_id).copied();
            replica
        })
        .collect();
    replicas.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    replicas.dedup_by(|a, b| a.node_id == b.node_id);
    Ok(replicas)
}

fn has_legacy(location: &RepoLocation) -> bool {
    location
        .legacy_replicas
        .as_deref()
        .is_some_and(|raw| !raw.trim().is_empty())
}

pub struct Backfill {
    state: StateStore,
}

impl Backfill {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    pub fn run(&self, now: u64) -> CapacityResult<BackfillReport> {
        let mut report = BackfillReport::default();
        for location in self.state.list_locations()? {
            report.locations_scanned += 1;
            if !has_legacy(&location) {
                continue;
            }
            report.legacy_locations += 1;

            let replicas = match legacy_replicas(&location, now) {
                Ok(replicas) => replicas,
                Err(e) => {
                    warn!(repo_id = location.repo_id, error = %e, "unparseable legacy replica columns");
                    report.parse_errors += 1;
                    continue;
                }
            };
            let named = location
                .legacy_replicas
                .as_deref()
                .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
                .map(|nodes| nodes.iter().filter(|n| **n == location.primary_node_id).count())
                .unwrap_or(0);
            report.skipped_primary += named;

            for replica in &replicas {
                match self.state.add_replica(replica) {
                    Ok(true) => report.rows_inserted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(repo_id = replica.repo_id, node_id = %replica.node_id, error = %e, "backfill insert failed");
                    }
                }
            }
        }
        if report.rows_inserted > 0 {
            info!(
                legacy = report.legacy_locations,
                inserted = report.rows_inserted,
                "legacy replicas backfilled"
            );
        } else {
            debug!(scanned = report.locations_scanned, "backfill found nothing to insert");
        }
        Ok(report)
    }

    pub fn stats(&self) -> CapacityResult<BackfillStats> {
        let mut stats = BackfillStats::default();
        for location in self.state.list_locations()? {
            if !has_legacy(&location) {
                continue;
            }
            stats.legacy_locations += 1;
            let Ok(expected) = legacy_replicas(&location, 0) else {
                continue;
            };
            stats.expected_replicas += expected.len();
            for replica in &expected {
                if self
                    .state
                    .get_replica(replica.repo_id, &replica.node_id)?
                    .is_some()
                {
                    stats.actual_replicas += 1;
                }
            }
        }
        stats.missing_replicas = stats.expected_replicas - stats.actual_replicas;
        Ok(stats)
    }
}
