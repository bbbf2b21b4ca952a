//! Client error types.

use scp_session::{RemoteError, SessionError};
use scp_wire::WireError;
use thiserror::Error;

/// Errors returned to client callers
#[derive(Error, Debug)]
pub enum ClientError {
    /// No subscription connection is established
    #[error("client is not connected")]
    NotConnected,

    /// The server answered with `STATUS=ERROR`
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Exchange or connection failure
    #[error("session error: {0}")]
    Session(SessionError),

    /// Socket or name resolution failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply did not match the expected type
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Identifier or RFI text the grammar cannot carry
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// TLS handshake failure
    #[error("TLS error: {0:#}")]
    Tls(anyhow::Error),
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Remote(remote) => ClientError::Remote(remote),
            SessionError::Io(io) => ClientError::Io(io),
            SessionError::Wire(wire) => ClientError::Wire(wire),
            other => ClientError::Session(other),
        }
    }
}

/// Result type alias using ClientError
pub type Result<T> = std::result::Result<T, ClientError>;
