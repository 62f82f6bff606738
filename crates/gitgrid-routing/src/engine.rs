//! Routing engine — maps a repository and an operation kind to a node.
//!
//! Location and node rows are cached with independent short TTLs. The write
//! path always re-reads the location so a write never lands behind a
//! promotion that another instance just committed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gitgrid_core::RoutingConfig;
use gitgrid_metrics::ReplicationMetrics;
use gitgrid_notify::{NotificationEvent, Notifier};
use gitgrid_state::{
    NodeId, NodeInfo, PromotionOutcome, RepoId, RepoLocation, Replica, StateStore, epoch_millis,
};

use crate::cache::TtlCache;
use crate::error::RoutingResult;
use crate::policy::{LagBounds, ReplicaSelectionPolicy};

/// Why a node was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteRole {
    Primary,
    Replica,
    /// A replica serving writes because the primary is unhealthy.
    PrimaryFailover,
}

/// A routing answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub repo_id: RepoId,
    pub node_id: NodeId,
    pub host: String,
    pub role: RouteRole,
    /// Lag of the chosen replica in the policy's unit; `None` for the primary.
    pub lag: Option<u64>,
}

/// Tunables lifted from `[routing]`.
#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub read_bounds: LagBounds,
    pub failover_bounds: LagBounds,
    pub failover_enabled: bool,
    pub promote_on_failover: bool,
    pub location_ttl: Duration,
    pub node_ttl: Duration,
}

impl RoutingSettings {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            read_bounds: LagBounds {
                max_lag_ms: config.read_max_lag_ms,
                max_lag_commits: config.read_max_lag_commits,
            },
            failover_bounds: LagBounds {
                max_lag_ms: config.failover_max_lag_ms,
                max_lag_commits: config.failover_max_lag_commits,
            },
            failover_enabled: config.failover_enabled,
            promote_on_failover: config.promote_on_failover,
            location_ttl: Duration::from_millis(config.location_cache_ttl_ms),
            node_ttl: Duration::from_millis(config.node_cache_ttl_ms),
        }
    }
}

pub struct RoutingEngine {
    store: StateStore,
    policy: Box<dyn ReplicaSelectionPolicy>,
    settings: RoutingSettings,
    metrics: Arc<dyn ReplicationMetrics>,
    notifier: Arc<dyn Notifier>,
    locations: Mutex<TtlCache<RepoId, RepoLocation>>,
    nodes: Mutex<TtlCache<NodeId, NodeInfo>>,
}

impl RoutingEngine {
    pub fn new(
        store: StateStore,
        policy: Box<dyn ReplicaSelectionPolicy>,
        settings: RoutingSettings,
        metrics: Arc<dyn ReplicationMetrics>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let locations = Mutex::new(TtlCache::new(settings.location_ttl));
        let nodes = Mutex::new(TtlCache::new(settings.node_ttl));
        Self {
            store,
            policy,
            settings,
            metrics,
            notifier,
            locations,
            nodes,
        }
    }

    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    /// Route a read: freshest healthy replica within the read bound, else
    /// the primary. `None` if the repository has no location or the
    /// primary's node record is missing.
    pub async fn route_for_read(&self, repo_id: RepoId) -> RoutingResult<Option<Decision>> {
        let Some(location) = self.location(repo_id, false).await? else {
            debug!(repo_id, "no location, read has no route");
            return Ok(None);
        };

        let candidates = self.eligible_replicas(repo_id).await?;
        if let Some(decision) = self
            .pick_replica(repo_id, &candidates, &self.settings.read_bounds, RouteRole::Replica)
            .await?
        {
            debug!(repo_id, node_id = %decision.node_id, lag = ?decision.lag, "read routed to replica");
            return Ok(Some(decision));
        }

        self.primary_decision(&location).await
    }

    /// Route a write to the primary, failing over to a replica when the
    /// primary is unhealthy and failover is enabled.
    pub async fn route_for_write(&self, repo_id: RepoId) -> RoutingResult<Option<Decision>> {
        let Some(location) = self.location(repo_id, true).await? else {
            debug!(repo_id, "no location, write has no route");
            return Ok(None);
        };

        let primary = self.node(&location.primary_node_id).await?;
        if primary.as_ref().is_some_and(NodeInfo::is_healthy) || !self.settings.failover_enabled {
            return self.primary_decision(&location).await;
        }

        let candidates = self.eligible_replicas(repo_id).await?;
        let failover = self
            .pick_replica(
                repo_id,
                &candidates,
                &self.settings.failover_bounds,
                RouteRole::PrimaryFailover,
            )
            .await?;
        let Some(decision) = failover else {
            warn!(
                repo_id,
                primary = %location.primary_node_id,
                "primary unhealthy and no failover candidate"
            );
            return self.primary_decision(&location).await;
        };

        if self.settings.promote_on_failover {
            self.update_primary(repo_id, &decision.node_id, "failover").await?;
        }
        info!(
            repo_id,
            from = %location.primary_node_id,
            to = %decision.node_id,
            promoted = self.settings.promote_on_failover,
            "write failed over"
        );
        Ok(Some(decision))
    }

    /// Make `node_id` the primary of `repo_id`. A no-op if it already is.
    pub async fn update_primary(
        &self,
        repo_id: RepoId,
        node_id: &str,
        actor: &str,
    ) -> RoutingResult<PromotionOutcome> {
        let outcome = self.store.promote(repo_id, node_id, actor, epoch_millis())?;
        match &outcome {
            PromotionOutcome::Promoted { old_primary } => {
                self.invalidate_location(repo_id).await;
                self.metrics.record_failover();
                self.notifier.notify(NotificationEvent::Failover {
                    repo_id,
                    old_primary: old_primary.clone(),
                    new_primary: node_id.to_string(),
                });
                info!(repo_id, %old_primary, new_primary = %node_id, %actor, "primary promoted");
            }
            PromotionOutcome::AlreadyPrimary => {
                debug!(repo_id, %node_id, "promotion skipped, already primary");
            }
            PromotionOutcome::LocationMissing => {
                warn!(repo_id, %node_id, "promotion skipped, repository has no location");
            }
        }
        Ok(outcome)
    }

    pub async fn invalidate_location(&self, repo_id: RepoId) {
        self.locations.lock().await.invalidate(&repo_id);
    }

    pub async fn invalidate_node(&self, node_id: &str) {
        self.nodes.lock().await.invalidate(&node_id.to_string());
    }

    async fn location(&self, repo_id: RepoId, force_fresh: bool) -> RoutingResult<Option<RepoLocation>> {
        let generation = {
            let mut cache = self.locations.lock().await;
            if !force_fresh {
                if let Some(location) = cache.get(&repo_id) {
                    return Ok(Some(location));
                }
            }
            cache.generation()
        };
        let location = self.store.get_location(repo_id)?;
        if let Some(ref location) = location {
            let mut cache = self.locations.lock().await;
            if !cache.insert_if_current(repo_id, location.clone(), generation) {
                debug!(repo_id, "location invalidated during load, not cached");
            }
        }
        Ok(location)
    }

    async fn node(&self, node_id: &str) -> RoutingResult<Option<NodeInfo>> {
        let key = node_id.to_string();
        let generation = {
            let mut cache = self.nodes.lock().await;
            if let Some(node) = cache.get(&key) {
                return Ok(Some(node));
            }
            cache.generation()
        };
        let node = self.store.get_node(node_id)?;
        if let Some(ref node) = node {
            self.nodes.lock().await.insert_if_current(key, node.clone(), generation);
        }
        Ok(node)
    }

    /// Replicas whose node exists and is healthy.
    async fn eligible_replicas(&self, repo_id: RepoId) -> RoutingResult<Vec<Replica>> {
        let mut eligible = Vec::new();
        for replica in self.store.list_replicas_for_repo(repo_id)? {
            match self.node(&replica.node_id).await? {
                Some(node) if node.is_healthy() => eligible.push(replica),
                _ => debug!(repo_id, node_id = %replica.node_id, "replica node unavailable"),
            }
        }
        Ok(eligible)
    }

    async fn pick_replica(
        &self,
        repo_id: RepoId,
        candidates: &[Replica],
        bounds: &LagBounds,
        role: RouteRole,
    ) -> RoutingResult<Option<Decision>> {
        let Some(replica) = self.policy.select(candidates, bounds) else {
            return Ok(None);
        };
        let Some(node) = self.node(&replica.node_id).await? else {
            return Ok(None);
        };
        Ok(Some(Decision {
            repo_id,
            node_id: node.id,
            host: node.host,
            role,
            lag: self.policy.lag_of(replica),
        }))
    }

    async fn primary_decision(&self, location: &RepoLocation) -> RoutingResult<Option<Decision>> {
        match self.node(&location.primary_node_id).await? {
            Some(node) => Ok(Some(Decision {
                repo_id: location.repo_id,
                node_id: node.id,
                host: node.host,
                role: RouteRole::Primary,
                lag: None,
            })),
            None => {
                warn!(
                    repo_id = location.repo_id,
                    primary = %location.primary_node_id,
                    "primary node record missing, no route"
                );
                Ok(None)
            }
        }
    }
}
