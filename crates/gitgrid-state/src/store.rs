//! StateStore — redb-backed control-plane persistence for GitGrid.
//!
//! Provides typed operations over nodes, repositories, locations, replicas,
//! replication tasks, dead letters and the routing audit. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Operations that must hold an invariant across rows (claiming a task,
//! deduplicating outstanding tasks, promotion, replica-set replacement) run
//! their read and write inside one write transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        txn.open_table(REPOSITORY_NAMES).map_err(map_err!(Table))?;
        txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(OUTSTANDING).map_err(map_err!(Table))?;
        txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &NodeInfo) -> StateResult<()> {
        let value = encode(node)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .insert(node.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a node by ID.
    pub fn get_node(&self, node_id: &str) -> StateResult<Option<NodeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        read_str(&table, node_id)
    }

    /// List all nodes.
    pub fn list_nodes(&self) -> StateResult<Vec<NodeInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(NODES).map_err(map_err!(Table))?;
        scan_str(&table, "")
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            existed = table.remove(node_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%node_id, existed, "node deleted");
        Ok(existed)
    }

    // ── Repositories ───────────────────────────────────────────────

    /// Insert or update repository metadata and its name index.
    pub fn put_repository(&self, repo: &RepositoryInfo) -> StateResult<()> {
        let value = encode(repo)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let previous: Option<RepositoryInfo> = {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            let previous = read_id(&table, repo.id)?;
            table
                .insert(repo.id, value.as_slice())
                .map_err(map_err!(Write))?;
            previous
        };
        {
            let mut names = txn.open_table(REPOSITORY_NAMES).map_err(map_err!(Table))?;
            if let Some(prev) = previous {
                if prev.full_name() != repo.full_name() {
                    names
                        .remove(prev.full_name().as_str())
                        .map_err(map_err!(Write))?;
                }
            }
            names
                .insert(repo.full_name().as_str(), repo.id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(repo_id = repo.id, name = %repo.full_name(), "repository stored");
        Ok(())
    }

    /// Get repository metadata by id.
    pub fn get_repository(&self, repo_id: RepoId) -> StateResult<Option<RepositoryInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        read_id(&table, repo_id)
    }

    /// Resolve `owner/name` to repository metadata.
    pub fn find_repository(&self, owner: &str, name: &str) -> StateResult<Option<RepositoryInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let names = txn.open_table(REPOSITORY_NAMES).map_err(map_err!(Table))?;
        let repo_id = names
            .get(full_name(owner, name).as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value());
        let Some(repo_id) = repo_id else {
            return Ok(None);
        };
        let table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        read_id(&table, repo_id)
    }

    /// List all repositories.
    pub fn list_repositories(&self) -> StateResult<Vec<RepositoryInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
        scan_id(&table)
    }

    /// Record the newest default-branch commit time. Older timestamps are
    /// ignored. Returns false if the repository is unknown.
    pub fn record_commit(&self, repo_id: RepoId, commit_at: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REPOSITORIES).map_err(map_err!(Table))?;
            let repo: Option<RepositoryInfo> = read_id(&table, repo_id)?;
            let Some(mut repo) = repo else {
                return Ok(false);
            };
            if repo.last_commit_at.is_some_and(|t| t >= commit_at) {
                return Ok(true);
            }
            repo.last_commit_at = Some(commit_at);
            let value = encode(&repo)?;
            table
                .insert(repo_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    // ── Locations ──────────────────────────────────────────────────

    /// Insert or update a repository's location.
    ///
    /// A replica row on the (new) primary node is removed in the same
    /// transaction so a node is never primary and replica of one repository.
    pub fn put_location(&self, location: &RepoLocation) -> StateResult<()> {
        let value = encode(location)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            table
                .insert(location.repo_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        {
            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let key = replica_key(location.repo_id, &location.primary_node_id);
            replicas.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(repo_id = location.repo_id, primary = %location.primary_node_id, "location stored");
        Ok(())
    }

    /// Get a repository's location.
    pub fn get_location(&self, repo_id: RepoId) -> StateResult<Option<RepoLocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        read_id(&table, repo_id)
    }

    /// List all locations.
    pub fn list_locations(&self) -> StateResult<Vec<RepoLocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        scan_id(&table)
    }

    /// List up to `limit` locations whose primary is `node_id`.
    pub fn list_locations_by_primary(
        &self,
        node_id: &str,
        limit: usize,
    ) -> StateResult<Vec<RepoLocation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let location: RepoLocation = decode(value.value())?;
            if location.primary_node_id == node_id {
                results.push(location);
            }
        }
        Ok(results)
    }

    /// Record the advisory last-written commit for a repository.
    pub fn record_write(&self, repo_id: RepoId, commit: &str, now: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            let location: Option<RepoLocation> = read_id(&table, repo_id)?;
            let Some(mut location) = location else {
                return Ok(false);
            };
            location.last_write_commit = Some(commit.to_string());
            location.updated_at = now;
            let value = encode(&location)?;
            table
                .insert(repo_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Delete a location and its replica rows. Returns true if it existed.
    pub fn delete_location(&self, repo_id: RepoId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            existed = table.remove(repo_id).map_err(map_err!(Write))?.is_some();
        }
        {
            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            for key in keys_with_prefix(&replicas, &repo_prefix(repo_id))? {
                replicas.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(repo_id, existed, "location deleted");
        Ok(existed)
    }

    // ── Replicas ───────────────────────────────────────────────────

    /// Attach a replica if absent. Returns false if the row already exists.
    ///
    /// Fails with `Conflict` if the node is the repository's primary.
    pub fn add_replica(&self, replica: &Replica) -> StateResult<bool> {
        let key = replica.table_key();
        let value = encode(replica)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        ensure_not_primary(&txn, replica.repo_id, &replica.node_id)?;
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Ok(false);
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "replica added");
        Ok(true)
    }

    /// Insert or overwrite a replica row.
    pub fn put_replica(&self, replica: &Replica) -> StateResult<()> {
        let key = replica.table_key();
        let value = encode(replica)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        ensure_not_primary(&txn, replica.repo_id, &replica.node_id)?;
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Point update of a replica's health and lag. Fields left `None` keep
    /// their current value. Returns the updated row, or `None` if absent.
    pub fn update_replica_status(
        &self,
        repo_id: RepoId,
        node_id: &str,
        health: Option<HealthStatus>,
        lag_ms: Option<u64>,
        lag_commits: Option<u64>,
        now: u64,
    ) -> StateResult<Option<Replica>> {
        let key = replica_key(repo_id, node_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let replica: Option<Replica> = read_str(&table, &key)?;
            let Some(mut replica) = replica else {
                return Ok(None);
            };
            if let Some(health) = health {
                replica.health = health;
            }
            if lag_ms.is_some() {
                replica.lag_ms = lag_ms;
            }
            if lag_commits.is_some() {
                replica.lag_commits = lag_commits;
            }
            replica.updated_at = now;
            let value = encode(&replica)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            replica
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(updated))
    }

    /// Get a single replica.
    pub fn get_replica(&self, repo_id: RepoId, node_id: &str) -> StateResult<Option<Replica>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        read_str(&table, &replica_key(repo_id, node_id))
    }

    /// List the replica set of a repository.
    pub fn list_replicas_for_repo(&self, repo_id: RepoId) -> StateResult<Vec<Replica>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        scan_str(&table, &repo_prefix(repo_id))
    }

    /// List every replica row.
    pub fn list_replicas(&self) -> StateResult<Vec<Replica>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        scan_str(&table, "")
    }

    /// Detach a replica. Returns true if it existed.
    pub fn remove_replica(&self, repo_id: RepoId, node_id: &str) -> StateResult<bool> {
        let key = replica_key(repo_id, node_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "replica removed");
        Ok(existed)
    }

    /// Replace a repository's whole replica set in one transaction.
    pub fn replace_replicas(&self, repo_id: RepoId, replicas: &[Replica]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for replica in replicas {
            if replica.repo_id != repo_id {
                return Err(StateError::Conflict(format!(
                    "replica for repository {} in replica set of {repo_id}",
                    replica.repo_id
                )));
            }
            ensure_not_primary(&txn, repo_id, &replica.node_id)?;
        }
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            for key in keys_with_prefix(&table, &repo_prefix(repo_id))? {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for replica in replicas {
                let value = encode(replica)?;
                table
                    .insert(replica.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(repo_id, count = replicas.len(), "replica set replaced");
        Ok(())
    }

    // ── Promotion ──────────────────────────────────────────────────

    /// Make `new_primary` the primary of `repo_id`.
    ///
    /// In one transaction: drop the new primary's replica row, record the
    /// old primary as a replica with unknown health and unset lag, rewrite
    /// the location, and append an audit record. Promoting the current
    /// primary changes nothing.
    pub fn promote(
        &self,
        repo_id: RepoId,
        new_primary: &str,
        actor: &str,
        now: u64,
    ) -> StateResult<PromotionOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let location: Option<RepoLocation> = {
            let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            read_id(&table, repo_id)?
        };
        let Some(mut location) = location else {
            return Ok(PromotionOutcome::LocationMissing);
        };
        if location.primary_node_id == new_primary {
            return Ok(PromotionOutcome::AlreadyPrimary);
        }

        let old_primary = location.primary_node_id.clone();
        {
            let mut replicas = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            replicas
                .remove(replica_key(repo_id, new_primary).as_str())
                .map_err(map_err!(Write))?;
            let demoted = Replica::unknown(repo_id, old_primary.clone(), now);
            let value = encode(&demoted)?;
            replicas
                .insert(demoted.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }

        location.primary_node_id = new_primary.to_string();
        location.updated_at = now;
        {
            let value = encode(&location)?;
            let mut table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
            table
                .insert(repo_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }

        let payload = serde_json::json!({
            "old_primary": old_primary,
            "new_primary": new_primary,
        })
        .to_string();
        insert_audit(
            &txn,
            &AuditRecord {
                actor: actor.to_string(),
                action: AuditAction::Promote,
                repo_id: Some(repo_id),
                node_id: Some(new_primary.to_string()),
                payload,
            },
            now,
        )?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(repo_id, %old_primary, %new_primary, "primary promoted");
        Ok(PromotionOutcome::Promoted { old_primary })
    }

    // ── Replication tasks ──────────────────────────────────────────

    /// Insert a PENDING task unless the `(repo, target)` pair already has a
    /// PENDING or RUNNING task. Returns the new task id, or `None` if the
    /// request was coalesced into the outstanding task.
    pub fn enqueue_task(&self, new: &NewTask, now: u64) -> StateResult<Option<TaskId>> {
        let key = replica_key(new.repo_id, &new.target_node_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let outstanding = txn.open_table(OUTSTANDING).map_err(map_err!(Table))?;
            if let Some(existing) = outstanding
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
            {
                debug!(%key, existing, "outstanding task exists, enqueue coalesced");
                return Ok(None);
            }
        }
        let id = next_id(&txn, TASK_SEQ)?;
        let task = ReplicationTask {
            id,
            repo_id: new.repo_id,
            source_node_id: new.source_node_id.clone(),
            target_node_id: new.target_node_id.clone(),
            status: TaskStatus::Pending,
            priority: new.priority,
            attempt: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        insert_task(&txn, &task)?;
        {
            let mut outstanding = txn.open_table(OUTSTANDING).map_err(map_err!(Table))?;
            outstanding
                .insert(key.as_str(), id)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = id, %key, priority = new.priority, "task enqueued");
        Ok(Some(id))
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: TaskId) -> StateResult<Option<ReplicationTask>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        read_id(&table, task_id)
    }

    /// PENDING tasks addressed to `node_id`, highest priority first, oldest
    /// first within a priority.
    pub fn list_pending_for_target(
        &self,
        node_id: &str,
        limit: usize,
    ) -> StateResult<Vec<ReplicationTask>> {
        let mut pending: Vec<ReplicationTask> = self
            .list_tasks(Some(TaskStatus::Pending))?
            .into_iter()
            .filter(|t| t.target_node_id == node_id)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    /// List tasks, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> StateResult<Vec<ReplicationTask>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let tasks: Vec<ReplicationTask> = scan_id(&table)?;
        Ok(match status {
            Some(status) => tasks.into_iter().filter(|t| t.status == status).collect(),
            None => tasks,
        })
    }

    /// Atomically move a task from PENDING to RUNNING.
    ///
    /// Returns the number of rows changed: 1 for the winning claimant, 0 if
    /// the task is missing or was already claimed.
    pub fn claim_task(&self, task_id: TaskId, now: u64) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let task: Option<ReplicationTask> = read_id(&table, task_id)?;
            let Some(mut task) = task.filter(|t| t.status == TaskStatus::Pending) else {
                return Ok(0);
            };
            task.status = TaskStatus::Running;
            task.attempt += 1;
            task.updated_at = now;
            let value = encode(&task)?;
            table
                .insert(task_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(1)
    }

    /// Mark a RUNNING task DONE. Returns false if it was not RUNNING.
    pub fn complete_task(&self, task_id: TaskId, now: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let task: Option<ReplicationTask> = read_id(&table, task_id)?;
            let Some(mut task) = task.filter(|t| t.status == TaskStatus::Running) else {
                return Ok(false);
            };
            task.status = TaskStatus::Done;
            task.last_error = None;
            task.updated_at = now;
            let value = encode(&task)?;
            table
                .insert(task_id, value.as_slice())
                .map_err(map_err!(Write))?;
            task
        };
        clear_outstanding(&txn, &task)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Record a failed execution of a RUNNING task.
    ///
    /// Below `max_attempts` the task returns to PENDING; at the budget it is
    /// marked FAILED and copied to the dead-letter store.
    pub fn fail_task(
        &self,
        task_id: TaskId,
        error: &str,
        max_attempts: u32,
        now: u64,
    ) -> StateResult<FailureOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let task: Option<ReplicationTask> = read_id(&table, task_id)?;
            let Some(mut task) = task.filter(|t| t.status == TaskStatus::Running) else {
                return Ok(FailureOutcome::Ignored);
            };
            task.status = if task.attempt >= max_attempts {
                TaskStatus::Failed
            } else {
                TaskStatus::Pending
            };
            task.last_error = Some(error.to_string());
            task.updated_at = now;
            let value = encode(&task)?;
            table
                .insert(task_id, value.as_slice())
                .map_err(map_err!(Write))?;
            task
        };

        let outcome = if task.status == TaskStatus::Failed {
            clear_outstanding(&txn, &task)?;
            let entry_id = next_id(&txn, DEAD_LETTER_SEQ)?;
            let entry = DeadLetterEntry {
                id: entry_id,
                task_id: task.id,
                repo_id: task.repo_id,
                source_node_id: task.source_node_id.clone(),
                target_node_id: task.target_node_id.clone(),
                priority: task.priority,
                attempt: task.attempt,
                last_error: task.last_error.clone(),
                created_at: now,
            };
            let value = encode(&entry)?;
            let mut table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
            table
                .insert(entry_id, value.as_slice())
                .map_err(map_err!(Write))?;
            FailureOutcome::DeadLettered { entry_id }
        } else {
            FailureOutcome::Retried
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    /// Return RUNNING tasks last touched before `cutoff` to PENDING.
    pub fn requeue_stale_running(&self, cutoff: u64, now: u64) -> StateResult<Vec<TaskId>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut requeued = Vec::new();
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let stale: Vec<ReplicationTask> = scan_id::<ReplicationTask>(&table)?
                .into_iter()
                .filter(|t| t.status == TaskStatus::Running && t.updated_at < cutoff)
                .collect();
            for mut task in stale {
                task.status = TaskStatus::Pending;
                task.last_error = Some("lease expired while running".to_string());
                task.updated_at = now;
                let value = encode(&task)?;
                table
                    .insert(task.id, value.as_slice())
                    .map_err(map_err!(Write))?;
                requeued.push(task.id);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(requeued)
    }

    // ── Dead letters ───────────────────────────────────────────────

    /// Oldest `limit` dead-letter entries.
    pub fn list_dead_letters(&self, limit: usize) -> StateResult<Vec<DeadLetterEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        let mut entries: Vec<DeadLetterEntry> = scan_id(&table)?;
        entries.truncate(limit);
        Ok(entries)
    }

    /// Get a dead-letter entry.
    pub fn get_dead_letter(&self, entry_id: u64) -> StateResult<Option<DeadLetterEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        read_id(&table, entry_id)
    }

    /// Re-insert a dead-letter entry as a fresh PENDING task and delete the
    /// entry, in one transaction. Returns `None` if the entry is gone.
    pub fn requeue_dead_letter(&self, entry_id: u64, now: u64) -> StateResult<Option<Requeue>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let entry: Option<DeadLetterEntry> = {
            let table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
            read_id(&table, entry_id)?
        };
        let Some(entry) = entry else {
            return Ok(None);
        };

        let key = replica_key(entry.repo_id, &entry.target_node_id);
        let existing = {
            let outstanding = txn.open_table(OUTSTANDING).map_err(map_err!(Table))?;
            outstanding
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
        };
        let result = match existing {
            Some(task_id) => Requeue::Coalesced(task_id),
            None => {
                let id = next_id(&txn, TASK_SEQ)?;
                let task = ReplicationTask {
                    id,
                    repo_id: entry.repo_id,
                    source_node_id: entry.source_node_id.clone(),
                    target_node_id: entry.target_node_id.clone(),
                    status: TaskStatus::Pending,
                    priority: entry.priority,
                    attempt: 0,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                };
                insert_task(&txn, &task)?;
                let mut outstanding = txn.open_table(OUTSTANDING).map_err(map_err!(Table))?;
                outstanding
                    .insert(key.as_str(), id)
                    .map_err(map_err!(Write))?;
                Requeue::Requeued(id)
            }
        };
        {
            let mut table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
            table.remove(entry_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(entry_id, ?result, "dead letter requeued");
        Ok(Some(result))
    }

    // ── Audit ──────────────────────────────────────────────────────

    /// Append an audit record. Returns its sequence number.
    pub fn append_audit(&self, record: &AuditRecord, now: u64) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id = insert_audit(&txn, record, now)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    /// Most recent `limit` audit records, newest first.
    pub fn list_audit(&self, limit: usize) -> StateResult<Vec<RoutingAudit>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn read_str<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn read_id<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
    key: u64,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_str<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(decode(value.value())?);
        }
    }
    Ok(results)
}

fn scan_id<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

fn keys_with_prefix(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            keys.push(key.value().to_string());
        }
    }
    Ok(keys)
}

fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(sequence)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn insert_task(txn: &WriteTransaction, task: &ReplicationTask) -> StateResult<()> {
    let value = encode(task)?;
    let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
    table
        .insert(task.id, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Drop the outstanding-index entry if it still points at `task`.
fn clear_outstanding(txn: &WriteTransaction, task: &ReplicationTask) -> StateResult<()> {
    let key = task.outstanding_key();
    let mut table = txn.open_table(OUTSTANDING).map_err(map_err!(Table))?;
    let current = table
        .get(key.as_str())
        .map_err(map_err!(Read))?
        .map(|guard| guard.value());
    if current == Some(task.id) {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

fn insert_audit(txn: &WriteTransaction, record: &AuditRecord, now: u64) -> StateResult<u64> {
    let id = next_id(txn, AUDIT_SEQ)?;
    let entry = RoutingAudit {
        id,
        actor: record.actor.clone(),
        action: record.action,
        repo_id: record.repo_id,
        node_id: record.node_id.clone(),
        payload: record.payload.clone(),
        created_at: now,
    };
    let value = encode(&entry)?;
    let mut table = txn.open_table(AUDIT).map_err(map_err!(Table))?;
    table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
    Ok(id)
}

fn ensure_not_primary(txn: &WriteTransaction, repo_id: RepoId, node_id: &str) -> StateResult<()> {
    let table = txn.open_table(LOCATIONS).map_err(map_err!(Table))?;
    let location: Option<RepoLocation> = read_id(&table, repo_id)?;
    if location.is_some_and(|l| l.primary_node_id == node_id) {
        return Err(StateError::Conflict(format!(
            "node {node_id} is the primary of repository {repo_id}"
        )));
    }
    Ok(())
}
