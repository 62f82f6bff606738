//! Node registry — heartbeats and stale-node detection.
//!
//! Nodes are never deleted here. A node that stops heartbeating is marked
//! unhealthy, which removes it from routing and placement until it reports
//! again.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use gitgrid_state::{NodeInfo, NodeStatus, StateResult, StateStore};

/// Load report carried by a heartbeat.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatReport {
    /// Required the first time a node reports; later reports may omit it.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub disk_usage_pct: f64,
    #[serde(default)]
    pub iops: f64,
    #[serde(default)]
    pub repo_count: u64,
}

pub struct NodeRegistry {
    state: StateStore,
    heartbeat_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(state: StateStore, heartbeat_timeout: Duration) -> Self {
        Self {
            state,
            heartbeat_timeout,
        }
    }

    /// Record a heartbeat, creating the node on first contact.
    ///
    /// Returns `None` when an unknown node reports without a host.
    pub fn heartbeat(
        &self,
        node_id: &str,
        report: &HeartbeatReport,
        now: u64,
    ) -> StateResult<Option<NodeInfo>> {
        let node = match self.state.get_node(node_id)? {
            Some(mut node) => {
                if let Some(host) = &report.host {
                    node.host = host.clone();
                }
                if report.zone.is_some() {
                    node.zone = report.zone.clone();
                }
                if report.region.is_some() {
                    node.region = report.region.clone();
                }
                if node.status == NodeStatus::Unhealthy {
                    info!(%node_id, "node recovered");
                    node.status = NodeStatus::Healthy;
                }
                node
            }
            None => {
                let Some(host) = report.host.clone() else {
                    warn!(%node_id, "heartbeat from unknown node without host");
                    return Ok(None);
                };
                info!(%node_id, %host, "node registered by heartbeat");
                NodeInfo {
                    id: node_id.to_string(),
                    host,
                    zone: report.zone.clone(),
                    region: report.region.clone(),
                    status: NodeStatus::Healthy,
                    disk_usage_pct: 0.0,
                    iops: 0.0,
                    repo_count: 0,
                    last_heartbeat: now,
                }
            }
        };

        let node = NodeInfo {
            disk_usage_pct: report.disk_usage_pct,
            iops: report.iops,
            repo_count: report.repo_count,
            last_heartbeat: now,
            ..node
        };
        self.state.put_node(&node)?;
        debug!(%node_id, disk = node.disk_usage_pct, repos = node.repo_count, "heartbeat received");
        Ok(Some(node))
    }

    /// Ensure a node row exists without touching its load metrics.
    pub fn ensure_node(
        &self,
        node_id: &str,
        host: &str,
        zone: Option<&str>,
        region: Option<&str>,
        now: u64,
    ) -> StateResult<NodeInfo> {
        if let Some(mut node) = self.state.get_node(node_id)? {
            if node.status == NodeStatus::Unhealthy {
                node.status = NodeStatus::Healthy;
            }
            node.last_heartbeat = now;
            self.state.put_node(&node)?;
            return Ok(node);
        }
        let node = NodeInfo {
            id: node_id.to_string(),
            host: host.to_string(),
            zone: zone.map(str::to_string),
            region: region.map(str::to_string),
            status: NodeStatus::Healthy,
            disk_usage_pct: 0.0,
            iops: 0.0,
            repo_count: 0,
            last_heartbeat: now,
        };
        self.state.put_node(&node)?;
        info!(%node_id, %host, "node created");
        Ok(node)
    }

    /// Mark healthy nodes silent for longer than the timeout as unhealthy.
    /// Returns the ids that changed.
    pub fn reap_stale(&self, now: u64) -> StateResult<Vec<String>> {
        let timeout_ms = self.heartbeat_timeout.as_millis() as u64;
        let mut reaped = Vec::new();
        for mut node in self.state.list_nodes()? {
            if node.status != NodeStatus::Healthy {
                continue;
            }
            if now.saturating_sub(node.last_heartbeat) <= timeout_ms {
                continue;
            }
            warn!(node_id = %node.id, last_heartbeat = node.last_heartbeat, "node missed heartbeats, marking unhealthy");
            node.status = NodeStatus::Unhealthy;
            self.state.put_node(&node)?;
            reaped.push(node.id);
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (StateStore, NodeRegistry) {
        let store = StateStore::open_in_memory().unwrap();
        let registry = NodeRegistry::new(store.clone(), Duration::from_secs(60));
        (store, registry)
    }

    fn report(host: Option<&str>, repos: u64) -> HeartbeatReport {
        HeartbeatReport {
            host: host.map(str::to_string),
            zone: Some("us-east-1a".to_string()),
            region: Some("us-east-1".to_string()),
            disk_usage_pct: 42.0,
            iops: 300.0,
            repo_count: repos,
        }
    }

    #[test]
    fn first_heartbeat_registers_node() {
        let (store, registry) = registry();
        let node = registry
            .heartbeat("node-a", &report(Some("a:8443"), 3), 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(node.host, "a:8443");
        assert_eq!(node.repo_count, 3);
        assert!(store.get_node("node-a").unwrap().unwrap().is_healthy());
    }

    #[test]
    fn unknown_node_without_host_is_ignored() {
        let (store, registry) = registry();
        assert!(registry.heartbeat("node-a", &report(None, 3), 1_000).unwrap().is_none());
        assert!(store.get_node("node-a").unwrap().is_none());
    }

    #[test]
    fn reaper_marks_silent_nodes_unhealthy() {
        let (store, registry) = registry();
        registry.heartbeat("old", &report(Some("old:1"), 0), 1_000).unwrap();
        registry.heartbeat("new", &report(Some("new:1"), 0), 100_000).unwrap();

        let reaped = registry.reap_stale(120_000).unwrap();
        assert_eq!(reaped, vec!["old".to_string()]);
        assert_eq!(store.get_node("old").unwrap().unwrap().status, NodeStatus::Unhealthy);
        assert!(store.get_node("new").unwrap().unwrap().is_healthy());

        // Already unhealthy: not reported twice, never deleted.
        assert_eq!(registry.reap_stale(500_000).unwrap(), vec!["new".to_string()]);
        assert_eq!(store.list_nodes().unwrap().len(), 2);
    }

    #[test]
    fn heartbeat_revives_unhealthy_node() {
        let (store, registry) = registry();
        registry.heartbeat("node-a", &report(Some("a:1"), 0), 1_000).unwrap();
        registry.reap_stale(100_000).unwrap();

        registry.heartbeat("node-a", &report(None, 5), 101_000).unwrap();
        let node = store.get_node("node-a").unwrap().unwrap();
        assert!(node.is_healthy());
        assert_eq!(node.host, "a:1");
        assert_eq!(node.repo_count, 5);
    }

    #[test]
    fn draining_node_is_left_draining() {
        let (store, registry) = registry();
        let mut node = registry
            .heartbeat("node-a", &report(Some("a:1"), 0), 1_000)
            .unwrap()
            .unwrap();
        node.status = NodeStatus::Draining;
        store.put_node(&node).unwrap();

        registry.heartbeat("node-a", &report(None, 0), 2_000).unwrap();
        assert_eq!(store.get_node("node-a").unwrap().unwrap().status, NodeStatus::Draining);
        assert!(registry.reap_stale(1_000_000).unwrap().is_empty());
    }

    #[test]
    fn ensure_node_keeps_existing_metrics() {
        let (store, registry) = registry();
        registry.heartbeat("seed", &report(Some("seed:1"), 9), 1_000).unwrap();
        registry.ensure_node("seed", "other:1", None, None, 2_000).unwrap();

        let node = store.get_node("seed").unwrap().unwrap();
        assert_eq!(node.host, "seed:1");
        assert_eq!(node.repo_count, 9);
        assert_eq!(node.last_heartbeat, 2_000);
    }
}
