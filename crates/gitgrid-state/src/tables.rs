//! redb table definitions for the GitGrid state store.
//!
//! String-keyed tables hold JSON values. Composite keys follow
//! `{repo_id}:{node_id}`.

use redb::TableDefinition;

/// Node info keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Repository metadata keyed by repository id.
pub const REPOSITORIES: TableDefinition<u64, &[u8]> = TableDefinition::new("repositories");

/// `{owner}/{name}` → repository id.
pub const REPOSITORY_NAMES: TableDefinition<&str, u64> = TableDefinition::new("repository_names");

/// Primary location keyed by repository id.
pub const LOCATIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("locations");

/// Replica state keyed by `{repo_id}:{node_id}`.
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");

/// Replication tasks keyed by task id.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// `{repo_id}:{target_node_id}` → id of the PENDING or RUNNING task for that pair.
pub const OUTSTANDING: TableDefinition<&str, u64> = TableDefinition::new("outstanding_tasks");

/// Dead-letter entries keyed by entry id.
pub const DEAD_LETTERS: TableDefinition<u64, &[u8]> = TableDefinition::new("dead_letters");

/// Append-only routing audit keyed by sequence number.
pub const AUDIT: TableDefinition<u64, &[u8]> = TableDefinition::new("routing_audit");

/// Monotonic id sequences keyed by sequence name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub(crate) const TASK_SEQ: &str = "tasks";
pub(crate) const DEAD_LETTER_SEQ: &str = "dead_letters";
pub(crate) const AUDIT_SEQ: &str = "audit";
