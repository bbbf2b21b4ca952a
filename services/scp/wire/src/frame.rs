//! Frame encoding and decoding.
//!
//! Every frame is a 3-byte header followed by the payload:
//!
//! ```text
//! +-----------------+-------------+-----------------------+
//! | u16 length (BE) | i8 type     | payload (length - 3)  |
//! +-----------------+-------------+-----------------------+
//! ```
//!
//! `length` counts the header itself. A length of zero is a heartbeat: two
//! bytes on the wire, no type, no payload, skipped by the decoder.

use crate::error::WireError;
use crate::rfi::Rfi;
use crate::signal::Signal;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Header size in bytes (u16 length + i8 type)
pub const HEAD_BYTES: usize = 3;

/// Maximum encoded frame size, header included
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEAD_BYTES;

/// Encoded heartbeat frame
pub const HEARTBEAT: [u8; 2] = [0, 0];

/// Frame types as defined in the wire protocol
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Exchange header carrying the RFI text
    Rfi = 1,
    /// Body chunk
    Data = 2,
    /// Body signal carrying Signal text
    Signal = 3,
    /// Terminal marker of an exchange
    End = 4,
}

impl TryFrom<i8> for FrameType {
    type Error = WireError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Rfi),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Signal),
            4 => Ok(FrameType::End),
            _ => Err(WireError::Type(value)),
        }
    }
}

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    typ: FrameType,
    payload: Bytes,
}

impl Frame {
    fn checked(typ: FrameType, payload: Bytes) -> Result<Self, WireError> {
        let length = HEAD_BYTES + payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(length));
        }
        Ok(Self { typ, payload })
    }

    /// Build an RFI frame; fails when the RFI would not parse back
    pub fn rfi(rfi: &Rfi) -> Result<Self, WireError> {
        rfi.validate()?;
        Self::checked(FrameType::Rfi, Bytes::from(rfi.to_string()))
    }

    /// Build a DATA frame; fails when the payload exceeds [`MAX_PAYLOAD_SIZE`]
    pub fn data(payload: impl Into<Bytes>) -> Result<Self, WireError> {
        Self::checked(FrameType::Data, payload.into())
    }

    /// Build a SIGNAL frame; fails when the signal would not parse back
    pub fn signal(signal: &Signal) -> Result<Self, WireError> {
        signal.validate()?;
        Self::checked(FrameType::Signal, Bytes::from(signal.to_string()))
    }

    /// Build an END frame
    pub fn end() -> Self {
        Self {
            typ: FrameType::End,
            payload: Bytes::new(),
        }
    }

    /// Split a body chunk into as many DATA frames as the frame budget requires.
    ///
    /// An empty chunk still produces one (empty) DATA frame.
    pub fn data_frames(payload: Bytes) -> Vec<Frame> {
        if payload.len() <= MAX_PAYLOAD_SIZE {
            return vec![Frame {
                typ: FrameType::Data,
                payload,
            }];
        }

        let total = payload.len().div_ceil(MAX_PAYLOAD_SIZE);
        let mut frames = Vec::with_capacity(total);
        let mut offset = 0;
        while offset < payload.len() {
            let end = std::cmp::min(offset + MAX_PAYLOAD_SIZE, payload.len());
            frames.push(Frame {
                typ: FrameType::Data,
                payload: payload.slice(offset..end),
            });
            offset = end;
        }
        frames
    }

    /// Frame type
    pub fn typ(&self) -> FrameType {
        self.typ
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Payload as text (RFI and SIGNAL frames)
    pub fn text(&self) -> Result<&str, WireError> {
        std::str::from_utf8(&self.payload).map_err(|_| WireError::Utf8)
    }

    /// Decode the payload of an RFI frame
    pub fn to_rfi(&self) -> Result<Rfi, WireError> {
        if self.typ != FrameType::Rfi {
            return Err(WireError::Malformed);
        }
        self.text()?.parse()
    }

    /// Decode the payload of a SIGNAL frame
    pub fn to_signal(&self) -> Result<Signal, WireError> {
        if self.typ != FrameType::Signal {
            return Err(WireError::Malformed);
        }
        self.text()?.parse()
    }

    /// Total encoded size, header included
    pub fn encoded_len(&self) -> usize {
        HEAD_BYTES + self.payload.len()
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u16(self.encoded_len() as u16);
        buf.put_i8(self.typ as i8);
        buf.put_slice(&self.payload);
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Incremental frame decoder.
///
/// Bytes of an incomplete frame stay in the buffer untouched until the rest
/// arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    heartbeats: u64,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of heartbeat frames skipped so far
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        loop {
            if buf.len() < 2 {
                return Ok(None);
            }

            let length = u16::from_be_bytes([buf[0], buf[1]]) as usize;

            if length == 0 {
                buf.advance(2);
                self.heartbeats += 1;
                trace!("skipped heartbeat frame");
                continue;
            }
            if length < HEAD_BYTES {
                return Err(WireError::Malformed);
            }
            if length > MAX_FRAME_SIZE {
                return Err(WireError::FrameTooLarge(length));
            }

            if buf.len() < length {
                return Ok(None);
            }

            let typ = FrameType::try_from(buf[2] as i8)?;
            buf.advance(HEAD_BYTES);
            let payload = buf.split_to(length - HEAD_BYTES).freeze();

            if typ == FrameType::End && !payload.is_empty() {
                return Err(WireError::Malformed);
            }

            return Ok(Some(Frame { typ, payload }));
        }
    }
}
