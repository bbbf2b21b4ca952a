//! Multiplexing of exchanges over one transport stream.
//!
//! A connection owns two tasks. The read task turns the frame stream into
//! [`IncomingExchange`] values and forwards body entries with backpressure:
//! when the consumer stops reading, the task stops reading the socket. The
//! write task serves a FIFO of [`OutgoingExchange`] jobs and writes only the
//! head job, so frames of different exchanges never interleave on the wire.

use crate::error::{Result, SessionError};
use crate::exchange::{BodyItem, Chunk, IncomingExchange, OutgoingExchange};
use crate::transport::{FrameReader, FrameWriter, IoStream};
use scp_wire::{Frame, FrameType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Tuning knobs for one connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Body entries buffered per incoming exchange before the socket stops being read
    pub read_buffer_frames: usize,
    /// Frames buffered per outgoing exchange before writers wait
    pub write_buffer_frames: usize,
    /// Outgoing exchanges allowed to wait behind the one being written
    pub max_queued_exchanges: usize,
    /// Largest body `read_to_end` will buffer
    pub max_body_bytes: usize,
    /// Idle keepalive period; `None` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_frames: 64,
            write_buffer_frames: 64,
            max_queued_exchanges: 1024,
            max_body_bytes: 16 * 1024 * 1024, // 16 MiB
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Counters for a connection
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames received
    pub frames_in: u64,
    /// Frames sent
    pub frames_out: u64,
    /// Bytes received
    pub bytes_in: u64,
    /// Bytes sent
    pub bytes_out: u64,
    /// Exchanges received
    pub exchanges_in: u64,
    /// Exchanges sent
    pub exchanges_out: u64,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    exchanges_in: AtomicU64,
    exchanges_out: AtomicU64,
}

struct OutboundJob {
    frames: mpsc::Receiver<Frame>,
    done: oneshot::Sender<Result<()>>,
}

struct Shared {
    id: u64,
    peer: Option<SocketAddr>,
    identity: RwLock<Option<String>>,
    subscribed: AtomicBool,
    closed: watch::Sender<bool>,
    jobs: mpsc::Sender<OutboundJob>,
    config: ConnectionConfig,
    counters: Counters,
}

impl Shared {
    fn label(&self) -> String {
        match self.peer {
            Some(peer) => format!("conn#{} ({})", self.id, peer),
            None => format!("conn#{}", self.id),
        }
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("Closing {}", self.label());
        }
    }
}

/// Cheap, cloneable reference to a live connection
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionHandle {
    /// Process-unique connection number
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Remote address, when the transport has one
    pub fn peer(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    /// Identifier the peer announced while subscribing
    pub fn identity(&self) -> Option<String> {
        self.shared
            .identity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Record the peer's identifier
    pub fn set_identity(&self, identity: impl Into<String>) {
        *self
            .shared
            .identity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(identity.into());
    }

    /// Whether the peer completed a subscription
    pub fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::Acquire)
    }

    /// Mark the peer as a broadcast subscriber
    pub fn set_subscribed(&self, subscribed: bool) {
        self.shared.subscribed.store(subscribed, Ordering::Release);
    }

    /// Queue a new outgoing exchange.
    ///
    /// The exchange is placed at the tail of the connection's FIFO; its frames
    /// reach the wire only after every earlier exchange ended.
    pub fn open_outgoing(&self) -> Result<OutgoingExchange> {
        if self.is_closed() {
            return Err(SessionError::ConnectionClosed);
        }
        let (frames_tx, frames_rx) = mpsc::channel(self.shared.config.write_buffer_frames.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        let job = OutboundJob {
            frames: frames_rx,
            done: done_tx,
        };
        self.shared.jobs.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::ConnectionClosed,
        })?;
        Ok(OutgoingExchange::new(frames_tx, done_rx))
    }

    /// Close the connection; pending outgoing exchanges fail
    pub fn close(&self) {
        self.shared.close();
    }

    /// Whether the connection is closed
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        wait_closed(&mut closed).await;
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> ConnectionStats {
        let c = &self.shared.counters;
        ConnectionStats {
            frames_in: c.frames_in.load(Ordering::Relaxed),
            frames_out: c.frames_out.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            exchanges_in: c.exchanges_in.load(Ordering::Relaxed),
            exchanges_out: c.exchanges_out.load(Ordering::Relaxed),
        }
    }
}

/// An established connection and the queue of exchanges it received.
///
/// Dropping the connection closes it.
pub struct Connection {
    handle: ConnectionHandle,
    incoming: mpsc::Receiver<IncomingExchange>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .finish()
    }
}

impl Connection {
    /// Start serving a transport stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(io: S, peer: Option<SocketAddr>, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (jobs_tx, jobs_rx) = mpsc::channel(config.max_queued_exchanges.max(1));
        let (accept_tx, accept_rx) = mpsc::channel(1);
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            identity: RwLock::new(None),
            subscribed: AtomicBool::new(false),
            closed: closed_tx,
            jobs: jobs_tx,
            config,
            counters: Counters::default(),
        });

        debug!("Opened {}", shared.label());

        tokio::spawn(read_loop(
            FrameReader::new(read_half),
            accept_tx,
            Arc::clone(&shared),
        ));
        tokio::spawn(write_loop(
            FrameWriter::new(write_half),
            jobs_rx,
            Arc::clone(&shared),
        ));

        Self {
            handle: ConnectionHandle { shared },
            incoming: accept_rx,
        }
    }

    /// Start serving an accepted or dialed socket
    pub fn from_io(io: IoStream, config: ConnectionConfig) -> Self {
        let peer = io.peer_addr().ok();
        Self::new(io, peer, config)
    }

    /// Next exchange initiated by the peer; `None` once the connection closed
    pub async fn accept(&mut self) -> Option<IncomingExchange> {
        self.incoming.recv().await
    }

    /// Shared handle usable from other tasks
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Queue a new outgoing exchange
    pub fn open_outgoing(&self) -> Result<OutgoingExchange> {
        self.handle.open_outgoing()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.close();
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

enum ReadState {
    Idle,
    Body(mpsc::Sender<BodyItem>),
    Discard,
}

async fn read_loop<R>(
    mut reader: FrameReader<R>,
    accept: mpsc::Sender<IncomingExchange>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = shared.closed.subscribe();
    let mut state = ReadState::Idle;

    let outcome = tokio::select! {
        biased;
        _ = wait_closed(&mut closed) => Err(SessionError::ConnectionClosed),
        result = read_frames(&mut reader, &accept, &shared, &mut state) => result,
    };

    match &outcome {
        Ok(()) => debug!("{} reached end of stream", shared.label()),
        Err(SessionError::ConnectionClosed) => {}
        Err(e) => warn!("Read error on {}: {}", shared.label(), e),
    }

    if let ReadState::Body(body) = state {
        // The consumer may be slow; deliver the failure behind buffered entries.
        tokio::spawn(async move {
            let _ = body.send(Err(SessionError::ConnectionClosed)).await;
        });
    }

    shared.close();
}

async fn read_frames<R>(
    reader: &mut FrameReader<R>,
    accept: &mpsc::Sender<IncomingExchange>,
    shared: &Shared,
    state: &mut ReadState,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = reader.next_frame().await? {
        shared.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        shared
            .counters
            .bytes_in
            .fetch_add(frame.encoded_len() as u64, Ordering::Relaxed);
        trace!("{} received {:?} frame", shared.label(), frame.typ());

        match frame.typ() {
            FrameType::Rfi => {
                if !matches!(state, ReadState::Idle) {
                    return Err(SessionError::Protocol(
                        "RFI received inside an open exchange".to_string(),
                    ));
                }
                let rfi = frame.to_rfi()?;
                debug!("{} incoming exchange {}", shared.label(), rfi);
                shared.counters.exchanges_in.fetch_add(1, Ordering::Relaxed);

                let (body_tx, body_rx) = mpsc::channel(shared.config.read_buffer_frames.max(1));
                let exchange = IncomingExchange::new(rfi, body_rx, shared.config.max_body_bytes);
                *state = match accept.send(exchange).await {
                    Ok(()) => ReadState::Body(body_tx),
                    Err(_) => ReadState::Discard,
                };
            }
            FrameType::Data | FrameType::Signal => {
                let chunk = if frame.typ() == FrameType::Data {
                    Chunk::Data(frame.into_payload())
                } else {
                    Chunk::Signal(frame.to_signal()?)
                };
                match state {
                    ReadState::Idle => {
                        return Err(SessionError::Protocol(
                            "body frame received outside an exchange".to_string(),
                        ));
                    }
                    ReadState::Body(body) => {
                        if body.send(Ok(chunk)).await.is_err() {
                            trace!("{} consumer dropped exchange, discarding body", shared.label());
                            *state = ReadState::Discard;
                        }
                    }
                    ReadState::Discard => {}
                }
            }
            FrameType::End => {
                if matches!(state, ReadState::Idle) {
                    return Err(SessionError::Protocol(
                        "END received outside an exchange".to_string(),
                    ));
                }
                *state = ReadState::Idle;
            }
        }
    }

    Ok(())
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut jobs: mpsc::Receiver<OutboundJob>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = shared.closed.subscribe();
    let mut heartbeat = shared.config.heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            job = jobs.recv() => {
                let Some(OutboundJob { frames, done }) = job else { break };
                let result = tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => Err(SessionError::ConnectionClosed),
                    result = write_exchange(&mut writer, frames, &shared) => result,
                };
                let failed = result.is_err();
                if let Err(e) = &result {
                    if !matches!(e, SessionError::ConnectionClosed) {
                        warn!("Write error on {}: {}", shared.label(), e);
                    }
                }
                let _ = done.send(result);
                if failed {
                    break;
                }
                if let Some(interval) = heartbeat.as_mut() {
                    interval.reset();
                }
            }
            _ = next_heartbeat(&mut heartbeat) => {
                trace!("Sending heartbeat on {}", shared.label());
                if let Err(e) = writer.write_heartbeat().await {
                    warn!("Heartbeat failed on {}: {}", shared.label(), e);
                    break;
                }
            }
        }
    }

    shared.close();

    jobs.close();
    while let Some(job) = jobs.recv().await {
        let _ = job.done.send(Err(SessionError::ConnectionClosed));
    }

    if let Err(e) = writer.shutdown().await {
        trace!("Shutdown of {} failed: {}", shared.label(), e);
    }
    let stats = ConnectionHandle { shared: Arc::clone(&shared) }.stats();
    info!("Connection {} closed. Stats: {:?}", shared.label(), stats);
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Write one exchange from its first frame to END, then flush
async fn write_exchange<W>(
    writer: &mut FrameWriter<W>,
    mut frames: mpsc::Receiver<Frame>,
    shared: &Shared,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut rfi_written = false;

    while let Some(frame) = frames.recv().await {
        match frame.typ() {
            FrameType::Rfi => {
                rfi_written = true;
                shared.counters.exchanges_out.fetch_add(1, Ordering::Relaxed);
            }
            FrameType::End => {
                write_counted(writer, &frame, shared).await?;
                return writer.flush().await;
            }
            _ => {}
        }
        write_counted(writer, &frame, shared).await?;
    }

    // Writer went away without ending; terminate what reached the wire.
    if rfi_written {
        debug!("{} outgoing exchange dropped before END", shared.label());
        write_counted(writer, &Frame::end(), shared).await?;
    }
    writer.flush().await
}

async fn write_counted<W>(writer: &mut FrameWriter<W>, frame: &Frame, shared: &Shared) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = writer.write_frame(frame).await?;
    shared.counters.frames_out.fetch_add(1, Ordering::Relaxed);
    shared
        .counters
        .bytes_out
        .fetch_add(written as u64, Ordering::Relaxed);
    Ok(())
}
