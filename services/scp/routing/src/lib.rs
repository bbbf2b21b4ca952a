//! Operation registration and dispatch for SCP servers.
//!
//! Operations are registered on an [`Executor`] in order. Each registration
//! compiles its operation name into a wildcard [`Pattern`] and appends a nexus
//! entry; [`Executor::attach`] mounts another executor under a segment prefix
//! so that calls such as `Billing.charge` reach a named group. A
//! [`Dispatcher`] walks the frozen list for every incoming call.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod error;
pub mod helpers;
pub mod pattern;
pub mod table;

pub use dispatch::{DispatchOutcome, Dispatcher, Handler, HandlerResult, Next};
pub use error::{Result, RoutingError};
pub use helpers::{conductor_handler, reply_handler};
pub use pattern::Pattern;
pub use table::{Executor, Node};

#[cfg(test)]
pub(crate) mod testing {
    use scp_session::{Connection, ConnectionConfig, IncomingExchange, OutgoingExchange};
    use scp_wire::{Mode, Parameters, SID};

    /// Caller and server ends of an in-memory connection
    pub struct Harness {
        pub caller: Connection,
        pub server: Connection,
    }

    impl Harness {
        pub fn new() -> Self {
            let (a, b) = tokio::io::duplex(64 * 1024);
            let config = ConnectionConfig {
                heartbeat_interval: None,
                ..Default::default()
            };
            Self {
                caller: Connection::new(a, None, config.clone()),
                server: Connection::new(b, None, config),
            }
        }
    }

    /// Send one call from the caller and return the server's exchange pair,
    /// with the outgoing side carrying the mirrored RFI.
    pub async fn exchange_pair(
        harness: &mut Harness,
        mode: Mode,
        operation: &str,
        body: &'static [u8],
    ) -> (IncomingExchange, OutgoingExchange) {
        let mut call = harness.caller.open_outgoing().unwrap();
        call.set_rfi(mode, operation, Parameters::new()).unwrap();
        call.open().await.unwrap();
        if !body.is_empty() {
            call.write(body).await.unwrap();
        }
        call.end().await.unwrap();

        let incoming = harness.server.accept().await.unwrap();
        let mut outgoing = harness.server.open_outgoing().unwrap();
        outgoing
            .set_rfi(
                incoming.mode(),
                incoming.operation(),
                Parameters::new().with(SID, "test-server"),
            )
            .unwrap();
        (incoming, outgoing)
    }
}
