//! gitgrid-state — embedded control-plane store for GitGrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the node registry,
//! repository metadata, primary locations, replica health, the replication
//! task queue, dead letters, and the routing audit log.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Replica keys are `{repo_id}:{node_id}` so a repository's replica set is a
//! prefix scan. Tasks, dead letters and audit records are keyed by `u64`
//! ids drawn from a sequence table inside the inserting transaction.
//!
//! redb admits one write transaction at a time, so every check-then-write
//! below (task claim, enqueue dedup, promotion) is atomic with respect to
//! every other writer sharing the `StateStore`.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
