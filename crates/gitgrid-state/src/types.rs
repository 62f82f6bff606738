//! Domain types for the GitGrid state store.
//!
//! These types represent the persisted control-plane state: storage nodes,
//! repositories, primary locations, replicas, replication tasks, dead
//! letters and audit records. Timestamps are Unix milliseconds.

use serde::{Deserialize, Serialize};

/// Unique identifier for a storage node.
pub type NodeId = String;

/// Unique identifier for a repository.
pub type RepoId = u64;

/// Unique identifier for a replication task.
pub type TaskId = u64;

// ── Node ──────────────────────────────────────────────────────────

/// Operational status of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
    Draining,
}

/// A storage node and its last reported load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Network location (`host[:port]`).
    pub host: String,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    pub status: NodeStatus,
    /// Disk usage, 0.0–100.0.
    #[serde(default)]
    pub disk_usage_pct: f64,
    #[serde(default)]
    pub iops: f64,
    /// Number of repositories hosted (primary or replica).
    #[serde(default)]
    pub repo_count: u64,
    /// Unix timestamp (ms) of last heartbeat.
    #[serde(default)]
    pub last_heartbeat: u64,
}

impl NodeInfo {
    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Healthy
    }
}

// ── Repository ────────────────────────────────────────────────────

/// Repository metadata consumed by routing and capacity decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryInfo {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub stars: u64,
    #[serde(default)]
    pub watchers: u64,
    /// Unix timestamp (ms) of the newest commit on the default branch.
    #[serde(default)]
    pub last_commit_at: Option<u64>,
    pub created_at: u64,
}

impl RepositoryInfo {
    /// Build the key for the name index.
    pub fn full_name(&self) -> String {
        full_name(&self.owner, &self.name)
    }
}

/// `{owner}/{name}`, the lookup key used by the routing query.
pub fn full_name(owner: &str, name: &str) -> String {
    format!("{owner}/{name}")
}

// ── Location ──────────────────────────────────────────────────────

/// The writable primary of a repository.
///
/// The `legacy_*` columns hold replica data from the denormalized schema:
/// a JSON array of node ids plus JSON maps of node id → health and
/// node id → lag in milliseconds. They are read only by the backfill.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoLocation {
    pub repo_id: RepoId,
    pub primary_node_id: NodeId,
    /// Advisory; the last commit written through the primary.
    #[serde(default)]
    pub last_write_commit: Option<String>,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_replicas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_replica_health: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_replica_lag: Option<String>,
}

impl RepoLocation {
    pub fn new(repo_id: RepoId, primary_node_id: impl Into<NodeId>, now: u64) -> Self {
        Self {
            repo_id,
            primary_node_id: primary_node_id.into(),
            last_write_commit: None,
            updated_at: now,
            legacy_replicas: None,
            legacy_replica_health: None,
            legacy_replica_lag: None,
        }
    }
}

// ── Replica ───────────────────────────────────────────────────────

/// Health of a replica as reported by the lag reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Lenient parse used for legacy data; anything unrecognised is `Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// A read-only mirror of a repository on a non-primary node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub repo_id: RepoId,
    pub node_id: NodeId,
    pub health: HealthStatus,
    /// Milliseconds behind the primary; unset until first reported.
    #[serde(default)]
    pub lag_ms: Option<u64>,
    /// Commits behind the primary; unset until first reported.
    #[serde(default)]
    pub lag_commits: Option<u64>,
    pub updated_at: u64,
}

impl Replica {
    /// A freshly attached replica: health unknown, lag unset.
    pub fn unknown(repo_id: RepoId, node_id: impl Into<NodeId>, now: u64) -> Self {
        Self {
            repo_id,
            node_id: node_id.into(),
            health: HealthStatus::Unknown,
            lag_ms: None,
            lag_commits: None,
            updated_at: now,
        }
    }

    /// Build the composite key for the replicas table.
    pub fn table_key(&self) -> String {
        replica_key(self.repo_id, &self.node_id)
    }
}

pub(crate) fn replica_key(repo_id: RepoId, node_id: &str) -> String {
    format!("{repo_id}:{node_id}")
}

pub(crate) fn repo_prefix(repo_id: RepoId) -> String {
    format!("{repo_id}:")
}

// ── Replication task ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    /// PENDING or RUNNING.
    pub fn is_outstanding(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// "Replicate repository R from node A to node B."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationTask {
    pub id: TaskId,
    pub repo_id: RepoId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub status: TaskStatus,
    /// 0–20, higher runs sooner.
    pub priority: u8,
    /// Number of times this task has been claimed.
    pub attempt: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ReplicationTask {
    pub(crate) fn outstanding_key(&self) -> String {
        replica_key(self.repo_id, &self.target_node_id)
    }
}

/// Input for inserting a task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub repo_id: RepoId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub priority: u8,
}

/// Result of recording a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Returned to PENDING for another attempt.
    Retried,
    /// Budget exhausted; moved to the dead-letter store.
    DeadLettered { entry_id: u64 },
    /// The task no longer exists or is not RUNNING.
    Ignored,
}

// ── Dead letters ──────────────────────────────────────────────────

/// A task that permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub id: u64,
    pub task_id: TaskId,
    pub repo_id: RepoId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub priority: u8,
    pub attempt: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: u64,
}

/// Result of re-inserting a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// A fresh PENDING task was inserted.
    Requeued(TaskId),
    /// The pair already had an outstanding task; the entry was dropped.
    Coalesced(TaskId),
}

// ── Promotion & audit ─────────────────────────────────────────────

/// Result of a promotion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted { old_primary: NodeId },
    /// The node already is the primary; nothing changed.
    AlreadyPrimary,
    /// The repository has no location row.
    LocationMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Promote,
    UpsertNode,
    DeleteNode,
    UpsertLocation,
    DeleteLocation,
    SyncReplicas,
    UpdateReplica,
}

/// Append-only record of a control-plane mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingAudit {
    pub id: u64,
    pub actor: String,
    pub action: AuditAction,
    #[serde(default)]
    pub repo_id: Option<RepoId>,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Serialized JSON describing the mutation.
    pub payload: String,
    pub created_at: u64,
}

/// Input for appending an audit record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub actor: String,
    pub action: AuditAction,
    pub repo_id: Option<RepoId>,
    pub node_id: Option<NodeId>,
    pub payload: String,
}

/// Current Unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
