//! gitgrid.toml configuration parser.
//!
//! Every section carries serde defaults, so an empty file yields a working
//! single-node configuration with routing on and capacity management off.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GitgridConfig {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub routing: RoutingConfig,
    pub replication: ReplicationConfig,
    pub priority: PriorityConfig,
    pub dead_letter: DeadLetterConfig,
    pub traffic: TrafficConfig,
    pub registry: RegistryConfig,
    pub notify: NotifyConfig,
    pub capacity: CapacityConfig,
}

/// Identity of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    /// Host (and optional port) other nodes and clients use to reach us.
    pub host: String,
    /// Scheme used when redirecting clients to another node.
    pub scheme: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            host: "127.0.0.1:8443".to_string(),
            scheme: "http".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/gitgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
    /// Shared secret for `/admin` and `/internal` routes. Blank disables the check.
    pub admin_key: String,
    /// Shared secret for the routing query. Blank disables the check.
    pub route_secret: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            admin_key: String::new(),
            route_secret: String::new(),
        }
    }
}

/// How replica staleness is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LagMode {
    /// Milliseconds behind the primary.
    Time,
    /// Commits behind the primary.
    Commits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub enabled: bool,
    pub lag_mode: LagMode,
    pub read_max_lag_ms: u64,
    pub read_max_lag_commits: u64,
    pub failover_enabled: bool,
    pub failover_max_lag_ms: u64,
    pub failover_max_lag_commits: u64,
    /// Promote the failover candidate synchronously before routing to it.
    pub promote_on_failover: bool,
    pub location_cache_ttl_ms: u64,
    pub node_cache_ttl_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lag_mode: LagMode::Time,
            read_max_lag_ms: 100,
            read_max_lag_commits: 0,
            failover_enabled: false,
            failover_max_lag_ms: 5_000,
            failover_max_lag_commits: 10,
            promote_on_failover: false,
            location_cache_ttl_ms: 2_000,
            node_cache_ttl_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Maximum tasks fetched per poll.
    pub batch_size: usize,
    /// Concurrent transfers per node.
    pub parallelism: usize,
    /// Attempts before a task is dead-lettered.
    pub max_attempts: u32,
    pub command_timeout_secs: u64,
    /// Root directory holding local repository copies.
    pub storage_root: PathBuf,
    /// URL scheme used to reach a source node's repositories.
    pub source_scheme: String,
    pub git_binary: String,
    /// Delete the target copy before every transfer.
    pub full_rebuild: bool,
    /// RUNNING tasks untouched for this long are returned to PENDING.
    /// Unset disables the reconciler.
    pub stale_running_after_secs: Option<u64>,
    pub reconcile_interval_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 5,
            batch_size: 20,
            parallelism: 4,
            max_attempts: 5,
            command_timeout_secs: 600,
            storage_root: PathBuf::from("/var/lib/gitgrid/repos"),
            source_scheme: "http".to_string(),
            git_binary: "git".to_string(),
            full_rebuild: false,
            stale_running_after_secs: None,
            reconcile_interval_secs: 60,
        }
    }
}

/// Priority scoring for replication tasks (0..=20, higher runs sooner).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub max_priority: u8,
    /// Reads per point of traffic boost.
    pub reads_per_point: u64,
    pub max_traffic_boost: u8,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            max_priority: 20,
            reads_per_point: 10,
            max_traffic_boost: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub reprocess_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            reprocess_interval_secs: 300,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Counters are cleared on this window.
    pub decay_interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            decay_interval_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_timeout_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 60,
            reap_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Blank disables outbound notifications.
    pub webhook_url: String,
    pub timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Master switch for rebalance, autoscale, provisioning and backfill loops.
    pub enabled: bool,
    pub rebalance: RebalanceConfig,
    pub autoscale: AutoscaleConfig,
    pub provision: ProvisionConfig,
    pub backfill: BackfillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    pub interval_secs: u64,
    pub max_disk_usage_pct: f64,
    pub max_repo_count: u64,
    pub max_iops: f64,
    /// Repositories moved per overloaded node per pass.
    pub batch_size: usize,
    pub promote_enabled: bool,
    /// Promotion bounds; the one matching `routing.lag_mode` applies.
    pub promote_max_lag_ms: u64,
    pub promote_max_lag_commits: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_disk_usage_pct: 85.0,
            max_repo_count: 5_000,
            max_iops: 20_000.0,
            batch_size: 10,
            promote_enabled: false,
            promote_max_lag_ms: 1_000,
            promote_max_lag_commits: 5,
        }
    }
}

/// Preference order when picking new replica nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZonePreference {
    SameZone,
    SameRegion,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub interval_secs: u64,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub traffic_thresholds: Vec<u64>,
    pub star_thresholds: Vec<u64>,
    pub watcher_thresholds: Vec<u64>,
    pub scale_down_enabled: bool,
    pub zone_preference: ZonePreference,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            min_replicas: 1,
            max_replicas: 3,
            traffic_thresholds: vec![20, 100, 300],
            star_thresholds: vec![100, 1_000],
            watcher_thresholds: vec![50, 500],
            scale_down_enabled: false,
            zone_preference: ZonePreference::SameZone,
        }
    }
}

/// A node every repository should be replicated to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNode {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub interval_secs: u64,
    pub seed_nodes: Vec<SeedNode>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            seed_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Run the legacy replica migration on a schedule as well as on demand.
    pub scheduled: bool,
    pub interval_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            scheduled: false,
            interval_secs: 3_600,
        }
    }
}

impl GitgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject inconsistent settings. Returns warnings for settings that are
    /// legal but fail open.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let autoscale = &self.capacity.autoscale;
        if autoscale.min_replicas > autoscale.max_replicas {
            return Err(ConfigError::Invalid(format!(
                "capacity.autoscale.min_replicas ({}) exceeds max_replicas ({})",
                autoscale.min_replicas, autoscale.max_replicas
            )));
        }
        if self.replication.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "replication.parallelism must be at least 1".to_string(),
            ));
        }
        if self.replication.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "replication.batch_size must be at least 1".to_string(),
            ));
        }
        if self.priority.max_priority > 20 {
            return Err(ConfigError::Invalid(format!(
                "priority.max_priority ({}) exceeds 20",
                self.priority.max_priority
            )));
        }
        if self.node.id.trim().is_empty() {
            return Err(ConfigError::Invalid("node.id must not be blank".to_string()));
        }

        let mut warnings = Vec::new();
        if self.api.admin_key.trim().is_empty() {
            warnings.push("api.admin_key is blank: admin endpoints are unauthenticated".to_string());
        }
        if self.api.route_secret.trim().is_empty() {
            warnings.push("api.route_secret is blank: routing query is unauthenticated".to_string());
        }
        Ok(warnings)
    }
}
