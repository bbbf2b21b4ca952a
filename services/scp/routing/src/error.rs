//! Routing error types.

use scp_session::SessionError;
use thiserror::Error;

/// Errors surfaced while dispatching a call
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Exchange or connection failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Handler failed outside the JSON error convention
    #[error("handler failed: {0}")]
    Handler(#[from] anyhow::Error),
}

/// Result type alias using RoutingError
pub type Result<T> = std::result::Result<T, RoutingError>;
