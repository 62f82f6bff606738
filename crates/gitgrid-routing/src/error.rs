//! Routing error types.

use thiserror::Error;

/// Errors that can occur while routing. Missing repositories and the
/// absence of a usable node are not errors; they surface as `None`.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("state store error: {0}")]
    State(#[from] gitgrid_state::StateError),
}

pub type RoutingResult<T> = Result<T, RoutingError>;
