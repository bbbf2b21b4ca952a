//! Session error types.

use crate::payload::RemoteError;
use scp_wire::WireError;
use thiserror::Error;

/// Errors raised by transport streams, exchanges and connections
#[derive(Error, Debug)]
pub enum SessionError {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing or grammar failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// JSON body could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Write attempted before `set_rfi` (RFI_NOT_SET)
    #[error("rfi not set")]
    RfiNotSet,

    /// RFI can no longer change once sent
    #[error("rfi already sent")]
    RfiAlreadySent,

    /// The connection is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// Too many outgoing exchanges waiting on one connection
    #[error("outgoing queue full")]
    QueueFull,

    /// Body exceeded the buffering budget
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Peer violated the exchange protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer answered with `STATUS=ERROR`
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Result type alias using SessionError
pub type Result<T> = std::result::Result<T, SessionError>;
