//! Sync executors — perform the actual repository transfer for a task.
//!
//! The worker runs on the target node, so the target copy lives under the
//! local storage root and the source is fetched over the network from the
//! source node's host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::process::Command;
use tracing::{debug, info};

use gitgrid_core::ReplicationConfig;
use gitgrid_state::{RepoId, ReplicationTask, StateStore};

/// Boxed future returned by executors.
pub type BoxFuture<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Transfers a repository from the task's source node to this node.
///
/// Implementations must have mirror semantics: safe to retry, converging to
/// the source's refs.
pub trait SyncExecutor: Send + Sync {
    fn execute<'a>(&'a self, task: &'a ReplicationTask) -> BoxFuture<'a>;
}

/// On-disk location of a repository under `root`, sharded by the low byte
/// of the id: `{root}/{id % 256:02x}/{id}.git`.
pub fn repo_storage_path(root: &Path, repo_id: RepoId) -> PathBuf {
    root.join(format!("{:02x}", repo_id % 256))
        .join(format!("{repo_id}.git"))
}

/// What a single execution will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorPlan {
    /// Target copy absent: `clone --mirror`.
    Clone { url: String, target: PathBuf },
    /// Target copy present: `fetch --prune` of every ref.
    Fetch { url: String, target: PathBuf },
}

impl MirrorPlan {
    pub fn args(&self) -> Vec<String> {
        match self {
            MirrorPlan::Clone { url, target } => vec![
                "clone".to_string(),
                "--mirror".to_string(),
                url.clone(),
                target.display().to_string(),
            ],
            MirrorPlan::Fetch { url, target } => vec![
                "-C".to_string(),
                target.display().to_string(),
                "fetch".to_string(),
                "--prune".to_string(),
                url.clone(),
                "+refs/*:refs/*".to_string(),
            ],
        }
    }
}

/// Runs the `git` binary as an external command.
pub struct GitMirrorExecutor {
    state: StateStore,
    storage_root: PathBuf,
    source_scheme: String,
    git_binary: String,
    timeout: Duration,
    full_rebuild: bool,
}

impl GitMirrorExecutor {
    pub fn new(state: StateStore, config: &ReplicationConfig) -> Self {
        Self {
            state,
            storage_root: config.storage_root.clone(),
            source_scheme: config.source_scheme.clone(),
            git_binary: config.git_binary.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
            full_rebuild: config.full_rebuild,
        }
    }

    pub fn source_url(&self, source_host: &str, repo_id: RepoId) -> String {
        format!(
            "{}://{}/internal/repos/{}.git",
            self.source_scheme, source_host, repo_id
        )
    }

    /// Decide between clone and fetch for `task`. With `full_rebuild` an
    /// existing target copy is deleted first, so the plan is always a clone.
    pub async fn plan(&self, task: &ReplicationTask, source_host: &str) -> anyhow::Result<MirrorPlan> {
        let url = self.source_url(source_host, task.repo_id);
        let target = repo_storage_path(&self.storage_root, task.repo_id);
        let mut exists = tokio::fs::try_exists(&target).await.unwrap_or(false);

        if exists && self.full_rebuild {
            tokio::fs::remove_dir_all(&target)
                .await
                .with_context(|| format!("removing {} for rebuild", target.display()))?;
            info!(repo_id = task.repo_id, target = %target.display(), "target removed for full rebuild");
            exists = false;
        }

        if exists {
            return Ok(MirrorPlan::Fetch { url, target });
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        Ok(MirrorPlan::Clone { url, target })
    }

    async fn run(&self, task: &ReplicationTask) -> anyhow::Result<()> {
        let source = self
            .state
            .get_node(&task.source_node_id)?
            .with_context(|| format!("source node {} not registered", task.source_node_id))?;
        let plan = self.plan(task, &source.host).await?;
        let args = plan.args();
        debug!(task_id = task.id, git = %self.git_binary, ?args, "running transfer");

        let mut command = Command::new(&self.git_binary);
        command.args(&args).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .with_context(|| format!("transfer timed out after {}s", self.timeout.as_secs()))?
            .with_context(|| format!("spawning {}", self.git_binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("transfer exited with {}: {}", output.status, stderr.trim());
        }
        Ok(())
    }
}

impl SyncExecutor for GitMirrorExecutor {
    fn execute<'a>(&'a self, task: &'a ReplicationTask) -> BoxFuture<'a> {
        Box::pin(self.run(task))
    }
}
