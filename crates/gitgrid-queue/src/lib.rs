//! gitgrid-queue — durable replication work for GitGrid.
//!
//! A push produces one PENDING task per replica of the repository. Workers
//! on each storage node poll for tasks addressed to them, claim each with an
//! atomic PENDING → RUNNING transition, and run the transfer on a bounded
//! pool. Failures retry up to a budget and then move to the dead-letter
//! store, which a periodic job feeds back into the queue.
//!
//! # Architecture
//!
//! ```text
//! Enqueuer ── priority (recency + traffic) ──▶ StateStore::enqueue_task
//!
//! ReplicationWorker (per node)
//!   ├── poll_once()   → list pending → permit → claim → spawn
//!   └── TaskProcessor → SyncExecutor → complete | retry | dead-letter
//!
//! DeadLetterReprocessor → requeue_dead_letter (notifies on failure)
//! StaleTaskReconciler   → RUNNING past lease → PENDING
//! ```

pub mod dlq;
pub mod enqueuer;
pub mod error;
pub mod executor;
pub mod priority;
pub mod processor;
pub mod reconciler;
pub mod worker;

pub use dlq::{DeadLetterReprocessor, ReprocessSummary};
pub use enqueuer::Enqueuer;
pub use error::{QueueError, QueueResult};
pub use executor::{BoxFuture, GitMirrorExecutor, MirrorPlan, SyncExecutor, repo_storage_path};
pub use priority::PriorityPolicy;
pub use processor::{ProcessOutcome, TaskProcessor};
pub use reconciler::StaleTaskReconciler;
pub use worker::{PollSummary, ReplicationWorker};
