//! gitgrid-routing — decides which storage node serves a repository.
//!
//! Reads go to the freshest healthy replica within the configured lag
//! bound, falling back to the primary. Writes go to the primary; when it is
//! unhealthy and failover is enabled, a replica within the looser failover
//! bound is chosen and optionally promoted.
//!
//! # Architecture
//!
//! ```text
//! RoutingEngine
//!   ├── route_for_read()   → location (TTL cache) + replicas → policy
//!   ├── route_for_write()  → location (fresh) → primary | failover
//!   └── update_primary()   → StateStore::promote + cache + metrics + webhook
//!
//! ReplicaSelectionPolicy (trait)
//!   ├── TimeLagPolicy      ← lag_mode = "time"
//!   └── CommitLagPolicy    ← lag_mode = "commits"
//!
//! NodeRegistry
//!   ├── heartbeat()        → upsert load metrics, mark healthy
//!   └── reap_stale()       → mark silent nodes unhealthy
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub mod policy;
pub mod registry;

pub use cache::TtlCache;
pub use engine::{Decision, RouteRole, RoutingEngine, RoutingSettings};
pub use error::{RoutingError, RoutingResult};
pub use policy::{CommitLagPolicy, LagBounds, ReplicaSelectionPolicy, TimeLagPolicy, policy_for};
pub use registry::{HeartbeatReport, NodeRegistry};
