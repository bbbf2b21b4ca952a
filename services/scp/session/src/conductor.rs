//! Multi-step signalling inside one exchange.
//!
//! A [`Conductor`] keeps an exchange pair open after the initial call so both
//! sides can trade further payloads and signals. Payloads are framed by the
//! [`PAYLOAD_START`] and [`PAYLOAD_END`] marker signals; every other signal is
//! surfaced as-is. A [`Coordinator`] fans one signal out to several
//! conductors and collects each answer.

use crate::connection::Connection;
use crate::error::{Result, SessionError};
use crate::exchange::{Chunk, IncomingExchange, OutgoingExchange};
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use scp_wire::{Rfi, Signal, Tags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

/// Marker signal opening a payload
pub const PAYLOAD_START: &str = "START";
/// Marker signal closing a payload
pub const PAYLOAD_END: &str = "END";

/// One unit read from a conductor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConductorEvent {
    /// Payload aggregated between the START and END markers
    Payload(Bytes),
    /// Any other signal
    Signal(Signal),
}

/// Live handle over one exchange pair
#[derive(Debug)]
pub struct Conductor {
    incoming: IncomingExchange,
    outgoing: Option<OutgoingExchange>,
    connection: Option<Connection>,
}

impl Conductor {
    /// Bind a conductor to an exchange pair
    pub fn new(incoming: IncomingExchange, outgoing: OutgoingExchange) -> Self {
        Self {
            incoming,
            outgoing: Some(outgoing),
            connection: None,
        }
    }

    /// Keep a dedicated connection alive for as long as the conductor lives
    pub fn bind_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Header of the incoming side
    pub fn rfi(&self) -> &Rfi {
        self.incoming.rfi()
    }

    /// Outgoing side, while the conductor is open
    pub fn outgoing_mut(&mut self) -> Option<&mut OutgoingExchange> {
        self.outgoing.as_mut()
    }

    fn writer(&mut self) -> Result<&mut OutgoingExchange> {
        self.outgoing.as_mut().ok_or(SessionError::ConnectionClosed)
    }

    /// Send the outgoing RFI without a payload
    pub async fn open(&mut self) -> Result<()> {
        self.writer()?.open().await
    }

    /// Write one payload unit: START, the chunk, END
    pub async fn deliver(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let out = self.writer()?;
        out.write_signal(&Signal::new(PAYLOAD_START)).await?;
        out.write(chunk).await?;
        out.write_signal(&Signal::new(PAYLOAD_END)).await
    }

    /// Deliver a value encoded as JSON
    pub async fn deliver_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.deliver(body).await
    }

    /// Write one bare signal
    pub async fn signal(&mut self, event: impl Into<String>, tags: Tags) -> Result<()> {
        let signal = Signal::new(event).with_tags(tags);
        self.send(&signal).await
    }

    /// Write an existing signal
    pub async fn send(&mut self, signal: &Signal) -> Result<()> {
        trace!("Conductor sending {}", signal);
        self.writer()?.write_signal(signal).await
    }

    /// Read the next payload or signal; `None` once the peer ended the exchange
    pub async fn next(&mut self) -> Result<Option<ConductorEvent>> {
        let mut payload: Option<BytesMut> = None;

        while let Some(chunk) = self.incoming.next_chunk().await {
            match chunk? {
                Chunk::Signal(signal) if signal.event == PAYLOAD_START && payload.is_none() => {
                    payload = Some(BytesMut::new());
                }
                Chunk::Signal(signal) if signal.event == PAYLOAD_END && payload.is_some() => {
                    let buffer = payload.take().unwrap_or_default();
                    return Ok(Some(ConductorEvent::Payload(buffer.freeze())));
                }
                Chunk::Signal(signal) => {
                    if payload.is_some() {
                        return Err(SessionError::Protocol(format!(
                            "signal {} inside a conductor payload",
                            signal.event
                        )));
                    }
                    return Ok(Some(ConductorEvent::Signal(signal)));
                }
                Chunk::Data(data) => match payload.as_mut() {
                    Some(buffer) => buffer.extend_from_slice(&data),
                    None => {
                        debug!("Unmarked data chunk in conductor body");
                        return Ok(Some(ConductorEvent::Payload(data)));
                    }
                },
            }
        }

        if payload.is_some() {
            return Err(SessionError::Protocol(
                "exchange ended inside a conductor payload".to_string(),
            ));
        }
        Ok(None)
    }

    /// Read the next event, which must be a signal
    pub async fn next_signal(&mut self) -> Result<Signal> {
        match self.next().await? {
            Some(ConductorEvent::Signal(signal)) => Ok(signal),
            Some(ConductorEvent::Payload(_)) => Err(SessionError::Protocol(
                "expected a signal, got a payload".to_string(),
            )),
            None => Err(SessionError::Protocol(
                "exchange ended while waiting for a signal".to_string(),
            )),
        }
    }

    /// Read the next event, which must be a payload
    pub async fn next_payload(&mut self) -> Result<Bytes> {
        match self.next().await? {
            Some(ConductorEvent::Payload(payload)) => Ok(payload),
            Some(ConductorEvent::Signal(signal)) => Err(SessionError::Protocol(format!(
                "expected a payload, got signal {}",
                signal.event
            ))),
            None => Err(SessionError::Protocol(
                "exchange ended while waiting for a payload".to_string(),
            )),
        }
    }

    /// Read the next payload and decode it as JSON
    pub async fn next_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.next_payload().await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// End the outgoing side; reading stays possible
    pub async fn close(&mut self) -> Result<()> {
        match self.outgoing.take() {
            Some(outgoing) => outgoing.end().await,
            None => Ok(()),
        }
    }

    /// End the outgoing side and discard whatever the peer still sends
    pub async fn finish(mut self) -> Result<()> {
        self.close().await?;
        self.incoming.drain().await
    }
}

/// Group of conductors signalled together
#[derive(Debug, Default)]
pub struct Coordinator {
    conductors: Vec<Conductor>,
}

impl Coordinator {
    /// Empty coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a conductor
    pub fn add(&mut self, conductor: Conductor) -> &mut Self {
        self.conductors.push(conductor);
        self
    }

    /// Number of conductors
    pub fn len(&self) -> usize {
        self.conductors.len()
    }

    /// Whether no conductor was added
    pub fn is_empty(&self) -> bool {
        self.conductors.is_empty()
    }

    /// Access one conductor
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Conductor> {
        self.conductors.get_mut(index)
    }

    /// Send the same signal to every conductor, then collect each one's next
    /// signal in conductor order.
    pub async fn signal(&mut self, event: impl Into<String>, tags: &Tags) -> Result<Vec<Signal>> {
        let signal = Signal::new(event).with_tags(tags.clone());
        try_join_all(self.conductors.iter_mut().map(|c| c.send(&signal))).await?;
        try_join_all(self.conductors.iter_mut().map(|c| c.next_signal())).await
    }

    /// Close every conductor
    pub async fn finish(self) -> Result<()> {
        try_join_all(self.conductors.into_iter().map(|c| c.finish())).await?;
        Ok(())
    }

    /// Take the conductors back
    pub fn into_inner(self) -> Vec<Conductor> {
        self.conductors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use scp_wire::{Mode, Parameters};

    /// Two connections and a conductor on each end of one CONDUCTOR exchange
    async fn conductor_pair() -> (Conductor, Conductor) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = ConnectionConfig {
            heartbeat_interval: None,
            ..Default::default()
        };
        let mut caller = Connection::new(a, None, config.clone());
        let mut callee = Connection::new(b, None, config);

        let mut call = caller.open_outgoing().unwrap();
        call.set_rfi(Mode::Conductor, "saga", Parameters::new()).unwrap();
        call.open().await.unwrap();
        let call_in = callee.accept().await.unwrap();

        let mut answer = callee.open_outgoing().unwrap();
        answer
            .set_rfi(Mode::Conductor, "saga", Parameters::new())
            .unwrap();
        answer.open().await.unwrap();
        let answer_in = caller.accept().await.unwrap();

        (
            Conductor::new(answer_in, call).bind_connection(caller),
            Conductor::new(call_in, answer).bind_connection(callee),
        )
    }

    #[tokio::test]
    async fn test_payloads_and_signals_alternate() {
        let (mut left, mut right) = conductor_pair().await;

        left.deliver(Bytes::from_static(b"first")).await.unwrap();
        left.signal("prepare", Tags::new().with("tx", "1"))
            .await
            .unwrap();
        left.deliver_json(&vec![1, 2, 3]).await.unwrap();
        left.close().await.unwrap();

        assert_eq!(
            right.next().await.unwrap(),
            Some(ConductorEvent::Payload(Bytes::from_static(b"first")))
        );
        let signal = right.next_signal().await.unwrap();
        assert_eq!(signal.event, "prepare");
        assert_eq!(signal.get("tx"), Some("1"));
        let numbers: Vec<i32> = right.next_json().await.unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(right.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_large_payload_is_reassembled() {
        let (mut left, mut right) = conductor_pair().await;
        let big = Bytes::from(vec![b'x'; 40_000]);

        let writer = tokio::spawn(async move {
            left.deliver(big).await.unwrap();
            left
        });
        let payload = right.next_payload().await.unwrap();
        assert_eq!(payload.len(), 40_000);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_coordinator_collects_answers_in_order() {
        let mut coordinator = Coordinator::new();
        let mut peers = Vec::new();
        for _ in 0..3 {
            let (local, remote) = conductor_pair().await;
            coordinator.add(local);
            peers.push(remote);
        }

        let answering = tokio::spawn(async move {
            for (index, peer) in peers.iter_mut().enumerate() {
                let signal = peer.next_signal().await.unwrap();
                assert_eq!(signal.event, "commit");
                peer.signal("ack", Tags::new().with("peer", index.to_string()))
                    .await
                    .unwrap();
            }
            peers
        });

        let answers = coordinator
            .signal("commit", &Tags::new().with("tx", "9"))
            .await
            .unwrap();
        let order: Vec<_> = answers.iter().map(|s| s.get("peer").unwrap()).collect();
        assert_eq!(order, vec!["0", "1", "2"]);
        assert!(answers.iter().all(|s| s.event == "ack"));

        let _peers = answering.await.unwrap();
        assert_eq!(coordinator.len(), 3);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let (mut left, mut right) = conductor_pair().await;
        left.send(&Signal::new(PAYLOAD_START)).await.unwrap();
        left.outgoing_mut()
            .unwrap()
            .write(Bytes::from_static(b"half"))
            .await
            .unwrap();
        left.close().await.unwrap();

        assert!(matches!(right.next().await, Err(SessionError::Protocol(_))));
    }
}
