//! gitgridd — the GitGrid daemon.
//!
//! Assembles every GitGrid subsystem in one process:
//! - State store (redb)
//! - Routing engine + node registry
//! - Replication queue, worker pool, dead-letter reprocessor
//! - Capacity manager (rebalancer, autoscaler, provisioner, backfill)
//! - REST API

pub mod daemon;
pub mod periodic;

pub use daemon::{Components, run};
pub use periodic::{PeriodicHandle, PeriodicTask};
