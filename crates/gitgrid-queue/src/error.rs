//! Queue error types.

use thiserror::Error;

/// Errors raised by queue components. Execution failures of a single task
/// are not errors at this level; they are recorded on the task.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("state store error: {0}")]
    State(#[from] gitgrid_state::StateError),

    #[error("repository {0} has no location")]
    LocationMissing(u64),
}

pub type QueueResult<T> = Result<T, QueueError>;
