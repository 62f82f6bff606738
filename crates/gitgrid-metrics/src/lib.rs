//! gitgrid-metrics — observability for the GitGrid control plane.
//!
//! Tracks per-repository read traffic (an input to replication priority
//! and autoscaling), counts replication outcomes, and renders both in the
//! Prometheus text exposition format.
//!
//! # Architecture
//!
//! ```text
//! TrafficTracker
//!   ├── record()               ← called per routing query
//!   ├── read_count()           → priority scoring (non-draining)
//!   ├── snapshot_and_reset()   → autoscaler pass (draining)
//!   └── decay()                → periodic window reset
//!
//! ReplicationMetrics (trait)
//!   ├── NoopMetrics            ← replication disabled
//!   └── ReplicationCounters    ← atomics, read by /metrics
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod prometheus;
pub mod replication;
pub mod traffic;

pub use prometheus::render_prometheus;
pub use replication::{NoopMetrics, ReplicationCounters, ReplicationMetrics, ReplicationSnapshot};
pub use traffic::TrafficTracker;
