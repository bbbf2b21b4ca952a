//! Per-call exchange streams.
//!
//! An exchange is one RFI, an ordered body of data chunks and signals, and a
//! terminal END frame. [`IncomingExchange`] is the read-only view handed out
//! by a [`Connection`](crate::Connection); [`OutgoingExchange`] is the
//! write-only view queued on a connection's FIFO.

use crate::error::{Result, SessionError};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use scp_wire::{Frame, Mode, Parameters, Rfi, Signal};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// One entry of an exchange body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Payload bytes
    Data(Bytes),
    /// Mid-body signal
    Signal(Signal),
}

pub(crate) type BodyItem = Result<Chunk>;

/// Read side of one exchange
#[derive(Debug)]
pub struct IncomingExchange {
    rfi: Rfi,
    body: mpsc::Receiver<BodyItem>,
    max_body_bytes: usize,
}

impl IncomingExchange {
    pub(crate) fn new(rfi: Rfi, body: mpsc::Receiver<BodyItem>, max_body_bytes: usize) -> Self {
        Self {
            rfi,
            body,
            max_body_bytes,
        }
    }

    /// The exchange header
    pub fn rfi(&self) -> &Rfi {
        &self.rfi
    }

    /// Exchange mode
    pub fn mode(&self) -> Mode {
        self.rfi.mode
    }

    /// Operation string
    pub fn operation(&self) -> &str {
        &self.rfi.operation
    }

    /// RFI parameters
    pub fn parameters(&self) -> &Parameters {
        &self.rfi.parameters
    }

    /// Get one RFI parameter
    pub fn get(&self, key: &str) -> Option<&str> {
        self.rfi.get(key)
    }

    /// Next body entry; `None` once the END frame was received
    pub async fn next_chunk(&mut self) -> Option<Result<Chunk>> {
        self.body.recv().await
    }

    /// Buffer the whole body, keeping data and skipping signals.
    ///
    /// Fails with [`SessionError::PayloadTooLarge`] once the body outgrows the
    /// connection's body budget.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(item) = self.body.recv().await {
            match item? {
                Chunk::Data(data) => {
                    if body.len() + data.len() > self.max_body_bytes {
                        return Err(SessionError::PayloadTooLarge(body.len() + data.len()));
                    }
                    body.extend_from_slice(&data);
                }
                Chunk::Signal(signal) => {
                    debug!("Skipping signal {} while buffering body", signal.event);
                }
            }
        }
        Ok(body.freeze())
    }

    /// Discard the rest of the body
    pub async fn drain(&mut self) -> Result<()> {
        while let Some(item) = self.body.recv().await {
            item?;
        }
        Ok(())
    }
}

impl Stream for IncomingExchange {
    type Item = Result<Chunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.body.poll_recv(cx)
    }
}

/// Write side of one exchange
#[derive(Debug)]
pub struct OutgoingExchange {
    rfi: Option<Rfi>,
    rfi_sent: bool,
    frames: mpsc::Sender<Frame>,
    done: oneshot::Receiver<Result<()>>,
}

impl OutgoingExchange {
    pub(crate) fn new(frames: mpsc::Sender<Frame>, done: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            rfi: None,
            rfi_sent: false,
            frames,
            done,
        }
    }

    /// Set the exchange header; allowed until the RFI was sent
    pub fn set_rfi(
        &mut self,
        mode: Mode,
        operation: impl Into<String>,
        parameters: Parameters,
    ) -> Result<()> {
        if self.rfi_sent {
            return Err(SessionError::RfiAlreadySent);
        }
        let rfi = Rfi::new(mode, operation).with_parameters(parameters);
        rfi.validate()?;
        self.rfi = Some(rfi);
        Ok(())
    }

    /// Change one RFI parameter before the RFI is sent
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if self.rfi_sent {
            return Err(SessionError::RfiAlreadySent);
        }
        let rfi = self.rfi.as_mut().ok_or(SessionError::RfiNotSet)?;
        let (key, value) = (key.into(), value.into());
        Parameters::validate_entry(&key, &value)?;
        rfi.parameters.set(key, value);
        Ok(())
    }

    /// The header, if set
    pub fn rfi(&self) -> Option<&Rfi> {
        self.rfi.as_ref()
    }

    /// Whether the RFI frame went out already
    pub fn is_rfi_sent(&self) -> bool {
        self.rfi_sent
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }

    async fn ensure_rfi(&mut self) -> Result<()> {
        if self.rfi_sent {
            return Ok(());
        }
        let frame = Frame::rfi(self.rfi.as_ref().ok_or(SessionError::RfiNotSet)?)?;
        self.send_frame(frame).await?;
        self.rfi_sent = true;
        trace!("Sent RFI {:?}", self.rfi);
        Ok(())
    }

    /// Send the RFI without any body entry
    pub async fn open(&mut self) -> Result<()> {
        self.ensure_rfi().await
    }

    /// Write a data chunk, splitting it across frames when needed
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        self.ensure_rfi().await?;
        for frame in Frame::data_frames(chunk.into()) {
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    /// Write one signal frame
    pub async fn write_signal(&mut self, signal: &Signal) -> Result<()> {
        self.ensure_rfi().await?;
        let frame = Frame::signal(signal)?;
        self.send_frame(frame).await
    }

    /// Write a body entry
    pub async fn write_chunk(&mut self, chunk: Chunk) -> Result<()> {
        match chunk {
            Chunk::Data(data) => self.write(data).await,
            Chunk::Signal(signal) => self.write_signal(&signal).await,
        }
    }

    /// Finish the exchange.
    ///
    /// Emits END only when the RFI was sent, then waits until the connection
    /// flushed every frame of this exchange. An exchange that never wrote
    /// anything ends without touching the wire.
    pub async fn end(mut self) -> Result<()> {
        if !self.rfi_sent {
            return Ok(());
        }
        self.send_frame(Frame::end()).await?;
        let OutgoingExchange { frames, done, .. } = self;
        drop(frames);
        done.await.map_err(|_| SessionError::ConnectionClosed)?
    }

    /// Copy every entry of `incoming` into this exchange, then end it
    pub async fn pipe_from(mut self, incoming: &mut IncomingExchange) -> Result<()> {
        self.open().await?;
        while let Some(chunk) = incoming.next_chunk().await {
            self.write_chunk(chunk?).await?;
        }
        self.end().await
    }
}
