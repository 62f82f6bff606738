//! Capacity manager error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("state store error: {0}")]
    State(#[from] gitgrid_state::StateError),

    #[error("queue error: {0}")]
    Queue(#[from] gitgrid_queue::QueueError),

    #[error("routing error: {0}")]
    Routing(#[from] gitgrid_routing::RoutingError),
}

pub type CapacityResult<T> = Result<T, CapacityError>;
