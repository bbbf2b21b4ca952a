//! Handler shapes for plain functions.
//!
//! [`reply_handler`] buffers the call body, decodes the JSON argument array,
//! runs the function and answers with its JSON result. [`conductor_handler`]
//! decodes the first conductor payload as arguments, answers with
//! `STATUS=OK` and lets the function drive the rest of the exchange.

use crate::dispatch::{Handler, HandlerResult, Next};
use crate::error::RoutingError;
use bytes::Bytes;
use scp_session::{
    decode_args, encode_value, Conductor, IncomingExchange, OutgoingExchange, RemoteError,
    SessionError,
};
use scp_wire::{STATUS, STATUS_ERROR, STATUS_OK};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Wrap `f` as a REPLY handler
pub fn reply_handler<A, R, E, F, Fut>(f: F) -> impl Handler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Into<RemoteError> + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let f = Arc::new(f);
    move |mut incoming: IncomingExchange, outgoing: OutgoingExchange, _next: Next| {
        let f = Arc::clone(&f);
        async move {
            let outcome: Result<R, RemoteError> = match incoming.read_to_end().await {
                Ok(body) => match decode_args::<A>(&body) {
                    Ok(args) => f(args).await.map_err(Into::into),
                    Err(e) => Err(RemoteError::from(e)),
                },
                Err(e @ SessionError::PayloadTooLarge(_)) => Err(RemoteError::from(e)),
                Err(e) => return Err(RoutingError::from(e)),
            };
            if let Err(error) = &outcome {
                debug!("{} failed: {}", incoming.operation(), error);
            }
            write_outcome(outgoing, outcome).await
        }
    }
}

/// Wrap `f` as a CONDUCTOR handler
pub fn conductor_handler<A, E, F, Fut>(f: F) -> impl Handler
where
    A: DeserializeOwned + Send + 'static,
    E: Into<RemoteError> + Send + 'static,
    F: Fn(A, Conductor) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    let f = Arc::new(f);
    move |incoming: IncomingExchange, outgoing: OutgoingExchange, _next: Next| {
        let f = Arc::clone(&f);
        async move {
            let operation = incoming.operation().to_string();
            let mut conductor = Conductor::new(incoming, outgoing);

            let args = match conductor.next_payload().await {
                Ok(payload) => decode_args::<A>(&payload),
                Err(e @ SessionError::Protocol(_)) => Err(e),
                Err(e) => return Err(RoutingError::from(e)),
            };
            let args = match args {
                Ok(args) => args,
                Err(e) => {
                    debug!("{} rejected its arguments: {}", operation, e);
                    let body = encode_value(&RemoteError::from(e))?;
                    return write_conductor_error(conductor, body).await;
                }
            };

            if let Some(outgoing) = conductor.outgoing_mut() {
                outgoing.set_parameter(STATUS, STATUS_OK)?;
            }
            conductor.open().await?;

            if let Err(e) = f(args, conductor).await {
                let error: RemoteError = e.into();
                warn!("Conductor {} failed after opening: {}", operation, error);
            }
            Ok::<(), RoutingError>(())
        }
    }
}

async fn write_outcome<R: Serialize>(
    mut outgoing: OutgoingExchange,
    outcome: Result<R, RemoteError>,
) -> HandlerResult {
    let (status, body) = match outcome.map(|value| encode_value(&value)) {
        Ok(Ok(body)) => (STATUS_OK, body),
        Ok(Err(e)) => (STATUS_ERROR, encode_value(&RemoteError::from(e))?),
        Err(error) => (STATUS_ERROR, encode_value(&error)?),
    };
    outgoing.set_parameter(STATUS, status)?;
    outgoing.write(body).await?;
    outgoing.end().await?;
    Ok(())
}

async fn write_conductor_error(mut conductor: Conductor, body: Bytes) -> HandlerResult {
    if let Some(outgoing) = conductor.outgoing_mut() {
        outgoing.set_parameter(STATUS, STATUS_ERROR)?;
        outgoing.write(body).await?;
    }
    conductor.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchOutcome, Dispatcher};
    use crate::table::Executor;
    use crate::testing::{exchange_pair, Harness};
    use scp_session::{decode_reply, PAYLOAD_END, PAYLOAD_START};
    use scp_wire::{Mode, Parameters, Signal, Tags, SID};
    use serde_json::{json, Value};

    fn executor() -> Executor {
        let mut executor = Executor::new();
        executor
            .reply("sum", |(a, b): (i64, i64)| async move {
                Ok::<_, RemoteError>(a + b)
            })
            .reply("boom", |_: Vec<Value>| async move {
                Err::<(), _>(RemoteError::new("boom").with_field("code", 7))
            })
            .conductor("saga", |(start,): (u32,), mut conductor: Conductor| async move {
                let signal = conductor.next_signal().await?;
                conductor
                    .signal("ack", Tags::new().with("step", (start + 1).to_string()))
                    .await?;
                conductor.deliver_json(&signal.event).await?;
                conductor.close().await?;
                Ok::<(), SessionError>(())
            });
        executor
    }

    async fn call(operation: &str, body: &'static [u8]) -> (scp_wire::Rfi, Result<Value, SessionError>) {
        let dispatcher = Dispatcher::new(executor());
        let mut harness = Harness::new();
        let (incoming, outgoing) = exchange_pair(&mut harness, Mode::Reply, operation, body).await;
        assert_eq!(
            dispatcher.dispatch(incoming, outgoing).await.unwrap(),
            DispatchOutcome::Handled
        );

        let mut reply = harness.caller.accept().await.unwrap();
        let body = reply.read_to_end().await.unwrap();
        let rfi = reply.rfi().clone();
        let value = decode_reply(&rfi, &body);
        (rfi, value)
    }

    #[tokio::test]
    async fn test_reply_returns_json_result() {
        let (rfi, value) = call("sum", b"[2,3]").await;
        assert_eq!(rfi.mode, Mode::Reply);
        assert_eq!(rfi.operation, "sum");
        assert_eq!(rfi.get(STATUS), Some(STATUS_OK));
        assert_eq!(rfi.get(SID), Some("test-server"));
        assert_eq!(value.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_reply_relays_errors() {
        let (rfi, value) = call("boom", b"[]").await;
        assert_eq!(rfi.get(STATUS), Some(STATUS_ERROR));
        match value {
            Err(SessionError::Remote(error)) => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.field("code"), Some(&json!(7)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reply_rejects_bad_arguments() {
        let (rfi, value) = call("sum", b"{\"a\":1}").await;
        assert_eq!(rfi.get(STATUS), Some(STATUS_ERROR));
        assert!(matches!(value, Err(SessionError::Remote(_))));

        let (_, value) = call("sum", b"[1]").await;
        assert!(matches!(value, Err(SessionError::Remote(_))));
    }

    #[tokio::test]
    async fn test_conductor_handler_round_trip() {
        let dispatcher = Dispatcher::new(executor());
        let mut harness = Harness::new();

        let mut call = harness.caller.open_outgoing().unwrap();
        call.set_rfi(Mode::Conductor, "saga", Parameters::new())
            .unwrap();
        call.write_signal(&Signal::new(PAYLOAD_START)).await.unwrap();
        call.write(Bytes::from_static(b"[41]")).await.unwrap();
        call.write_signal(&Signal::new(PAYLOAD_END)).await.unwrap();

        let incoming = harness.server.accept().await.unwrap();
        let mut answer = harness.server.open_outgoing().unwrap();
        answer
            .set_rfi(Mode::Conductor, "saga", Parameters::new())
            .unwrap();
        let serving = tokio::spawn(async move { dispatcher.dispatch(incoming, answer).await });

        let reply = harness.caller.accept().await.unwrap();
        assert_eq!(reply.get(STATUS), Some(STATUS_OK));
        let mut local = Conductor::new(reply, call);

        local.signal("go", Tags::new()).await.unwrap();
        let ack = local.next_signal().await.unwrap();
        assert_eq!(ack.event, "ack");
        assert_eq!(ack.get("step"), Some("42"));
        let echoed: String = local.next_json().await.unwrap();
        assert_eq!(echoed, "go");
        assert!(local.next().await.unwrap().is_none());
        local.close().await.unwrap();

        assert_eq!(serving.await.unwrap().unwrap(), DispatchOutcome::Handled);
    }

    #[tokio::test]
    async fn test_conductor_handler_rejects_bad_arguments() {
        let dispatcher = Dispatcher::new(executor());
        let mut harness = Harness::new();

        let mut call = harness.caller.open_outgoing().unwrap();
        call.set_rfi(Mode::Conductor, "saga", Parameters::new())
            .unwrap();
        call.write_signal(&Signal::new(PAYLOAD_START)).await.unwrap();
        call.write(Bytes::from_static(b"[\"nope\"]")).await.unwrap();
        call.write_signal(&Signal::new(PAYLOAD_END)).await.unwrap();

        let incoming = harness.server.accept().await.unwrap();
        let mut answer = harness.server.open_outgoing().unwrap();
        answer
            .set_rfi(Mode::Conductor, "saga", Parameters::new())
            .unwrap();
        dispatcher.dispatch(incoming, answer).await.unwrap();

        let mut reply = harness.caller.accept().await.unwrap();
        let body = reply.read_to_end().await.unwrap();
        assert!(matches!(
            decode_reply(reply.rfi(), &body),
            Err(SessionError::Remote(_))
        ));
    }
}
