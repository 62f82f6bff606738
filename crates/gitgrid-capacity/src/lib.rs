//! gitgrid-capacity — reshapes the node ↔ replica graph.
//!
//! Three periodic passes, each a no-op while `capacity.enabled` is false:
//!
//! - **Rebalancer** — moves replicas off nodes over a disk, repo-count, or
//!   IOPS threshold, optionally promoting the new copy
//! - **Autoscaler** — grows (and optionally shrinks) each repository's
//!   replica count from read traffic, stars, and watchers
//! - **Provisioner** — keeps the configured seed nodes registered and
//!   attached to every repository
//!
//! Plus the **Backfill** that materializes legacy denormalized replica
//! lists into replica rows, and the repository event handlers that seed new
//! repositories and fan pushes out to replicas.

pub mod backfill;
pub mod error;
pub mod events;
pub mod provisioner;
pub mod rebalancer;
pub mod scaler;

pub use backfill::{Backfill, BackfillReport, BackfillStats};
pub use error::{CapacityError, CapacityResult};
pub use events::RepositoryEvents;
pub use provisioner::{ProvisionSummary, Provisioner};
pub use rebalancer::{RebalanceSummary, Rebalancer, is_overloaded};
pub use scaler::{Autoscaler, ScaleAction, ScaleDecision, decide, desired_replicas};
