//! Wire protocol framing and the RFI/Signal addressing grammar for SCP.
//!
//! This crate provides the low-level pieces every SCP peer shares: the
//! length-prefixed frame codec, the text encodings of Remote Function
//! Identifiers and Signals, and the ordered parameter maps both carry.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 length           | total frame size (<= 16384)|
//! +----------------------+----------------------------+
//! | i8 type              | RFI=1 DATA=2 SIGNAL=3 END=4|
//! +----------------------+----------------------------+
//! | payload              | length - 3 bytes           |
//! +----------------------+----------------------------+
//! ```
//!
//! ## Text Grammar
//!
//! ```text
//! RFI    := MODE:operation(#KEY=VAL(&KEY=VAL)*)?
//! Signal := EVENT(%KEY=VAL(&KEY=VAL)*)?
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod params;
pub mod rfi;
pub mod signal;

// Re-export main types
pub use error::WireError;
pub use frame::{
    Frame, FrameDecoder, FrameType, HEAD_BYTES, HEARTBEAT, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
};
pub use params::{Parameters, CID, SID, STATUS, STATUS_ERROR, STATUS_OK};
pub use rfi::{Mode, Rfi};
pub use signal::{Signal, Tags};
