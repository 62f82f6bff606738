//! Repository lifecycle events consumed from the application layer.

use std::sync::Arc;

use tracing::{debug, info};

use gitgrid_queue::Enqueuer;
use gitgrid_state::{NodeId, RepoId, RepoLocation, RepositoryInfo, StateStore, TaskId};

use crate::error::CapacityResult;
use crate::provisioner::Provisioner;

pub struct RepositoryEvents {
    state: StateStore,
    enqueuer: Arc<Enqueuer>,
    provisioner: Arc<Provisioner>,
}

impl RepositoryEvents {
    pub fn new(state: StateStore, enqueuer: Arc<Enqueuer>, provisioner: Arc<Provisioner>) -> Self {
        Self {
            state,
            enqueuer,
            provisioner,
        }
    }

    /// Register a new repository, place its primary on `primary_node_id`
    /// and attach the seed replicas. An existing location is kept.
    pub async fn on_repository_created(
        &self,
        repo: &RepositoryInfo,
        primary_node_id: &str,
        now: u64,
    ) -> CapacityResult<Vec<NodeId>> {
        self.state.put_repository(repo)?;
        match self.state.get_location(repo.id)? {
            Some(existing) => {
                debug!(repo_id = repo.id, primary = %existing.primary_node_id, "location already present");
            }
            None => {
                self.state
                    .put_location(&RepoLocation::new(repo.id, primary_node_id, now))?;
                info!(repo_id = repo.id, name = %repo.full_name(), primary = %primary_node_id, "repository placed");
            }
        }
        self.provisioner.ensure_seed_nodes(now)?;
        self.provisioner.provision_repo(repo.id, now).await
    }

    /// Record a completed push and fan it out to the replicas.
    ///
    /// A repository seen for the first time is placed on `primary_hint`.
    /// `commit_at` is the pushed default-branch commit time, which feeds the
    /// recency part of the task priority.
    pub async fn on_repository_pushed(
        &self,
        repo_id: RepoId,
        primary_hint: Option<&str>,
        commit: Option<&str>,
        commit_at: Option<u64>,
        now: u64,
    ) -> CapacityResult<Vec<TaskId>> {
        if let Some(at) = commit_at {
            self.state.record_commit(repo_id, at)?;
        }
        if let (None, Some(primary)) = (self.state.get_location(repo_id)?, primary_hint) {
            self.state
                .put_location(&RepoLocation::new(repo_id, primary, now))?;
            info!(repo_id, %primary, "repository placed on first write");
            self.provisioner.ensure_seed_nodes(now)?;
            self.provisioner.provision_repo(repo_id, now).await?;
        }
        if let Some(commit) = commit {
            self.state.record_write(repo_id, commit, now)?;
        }
        Ok(self.enqueuer.on_push(repo_id, now).await?)
    }
}
