//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame would exceed the fixed frame budget (FRAME_TOO_LARGE)
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Unknown frame type tag
    #[error("unknown frame type {0}")]
    Type(i8),

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,

    /// Payload is not valid UTF-8 where text is required
    #[error("frame payload is not valid utf-8")]
    Utf8,

    /// RFI text could not be parsed
    #[error("malformed rfi: {0}")]
    Rfi(String),

    /// Signal text could not be parsed
    #[error("malformed signal: {0}")]
    Signal(String),

    /// Text contains a character the grammar uses as a delimiter
    #[error("reserved delimiter in {0}")]
    Reserved(String),
}
