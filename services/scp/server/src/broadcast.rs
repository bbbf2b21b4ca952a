//! Fan-out of server-originated BROADCAST exchanges.

use crate::error::Result;
use crate::server::ServerHandle;
use futures::future::join_all;
use scp_session::{encode_args, ConnectionHandle, OutgoingExchange, SessionError};
use scp_wire::{Mode, Parameters, SID};
use serde::Serialize;
use tracing::{debug, info, warn};

impl ServerHandle {
    /// Push `operation` with `args` to every subscribed connection.
    ///
    /// Each exchange is queued behind whatever the connection is already
    /// writing. Resolves once every connection flushed its copy and returns the
    /// identities that did; connections that fail are logged and left out.
    pub async fn broadcast<A>(&self, operation: &str, args: &A) -> Result<Vec<String>>
    where
        A: Serialize + ?Sized,
    {
        let body = encode_args(args)?;

        let mut queued: Vec<(ConnectionHandle, OutgoingExchange)> = Vec::new();
        for entry in self.state.registry.iter() {
            let handle = entry.value();
            if !handle.is_subscribed() {
                continue;
            }
            match self.open_broadcast(handle, operation) {
                Ok(outgoing) => queued.push((handle.clone(), outgoing)),
                Err(e) => warn!(
                    "Cannot queue broadcast {} on connection {}: {}",
                    operation,
                    handle.id(),
                    e
                ),
            }
        }

        if queued.is_empty() {
            debug!("No subscribers for broadcast {}", operation);
            return Ok(Vec::new());
        }

        let deliveries = queued.into_iter().map(|(handle, mut outgoing)| {
            let body = body.clone();
            async move {
                let delivered = async {
                    outgoing.write(body).await?;
                    outgoing.end().await
                }
                .await;
                (handle, delivered)
            }
        });

        let mut identities = Vec::new();
        for (handle, delivered) in join_all(deliveries).await {
            match delivered {
                Ok(()) => {
                    if let Some(identity) = handle.identity() {
                        identities.push(identity);
                    }
                }
                Err(e) => warn!(
                    "Broadcast {} to connection {} failed: {}",
                    operation,
                    handle.id(),
                    e
                ),
            }
        }

        info!(
            "Broadcast {} delivered to {} subscribers",
            operation,
            identities.len()
        );
        Ok(identities)
    }

    fn open_broadcast(
        &self,
        handle: &ConnectionHandle,
        operation: &str,
    ) -> std::result::Result<OutgoingExchange, SessionError> {
        let mut outgoing = handle.open_outgoing()?;
        outgoing.set_rfi(
            Mode::Broadcast,
            operation,
            Parameters::new().with(SID, self.state.identifier.as_str()),
        )?;
        Ok(outgoing)
    }
}
