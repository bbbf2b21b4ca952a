//! Server error types.

use scp_routing::RoutingError;
use scp_session::SessionError;
use scp_wire::WireError;
use thiserror::Error;

/// Errors raised by the server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listener failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Exchange or connection failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Identifier the grammar cannot carry
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Dispatch failure
    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),
}

/// Result type alias using ServerError
pub type Result<T> = std::result::Result<T, ServerError>;
