//! SUBSCRIBE round-trip performed right after a client connects.
//!
//! The client announces its identifier in `CID`; the server records it,
//! marks the connection as a broadcast subscriber and mirrors the RFI back
//! with its own `SID` and an empty body.

use crate::connection::{Connection, ConnectionHandle};
use crate::error::{Result, SessionError};
use crate::exchange::IncomingExchange;
use scp_wire::{Mode, Parameters, Rfi, CID, SID};
use tracing::{debug, info};

/// Operation name carried by subscription exchanges
pub const SUBSCRIBE_OPERATION: &str = "subscribe";

/// Client side: subscribe and wait for the server's acknowledgement.
///
/// Returns the mirrored RFI; its `SID` parameter names the server.
pub async fn subscribe(connection: &mut Connection, cid: &str) -> Result<Rfi> {
    let mut outgoing = connection.open_outgoing()?;
    outgoing.set_rfi(
        Mode::Subscribe,
        SUBSCRIBE_OPERATION,
        Parameters::new().with(CID, cid),
    )?;
    outgoing.open().await?;
    outgoing.end().await?;
    debug!("Sent SUBSCRIBE with {}={}", CID, cid);

    let mut reply = connection
        .accept()
        .await
        .ok_or(SessionError::ConnectionClosed)?;
    if reply.mode() != Mode::Subscribe {
        return Err(SessionError::Protocol(format!(
            "expected SUBSCRIBE acknowledgement, got {}",
            reply.rfi()
        )));
    }
    reply.drain().await?;

    info!(
        "Subscribed as {} to server {}",
        cid,
        reply.get(SID).unwrap_or("<unnamed>")
    );
    Ok(reply.rfi().clone())
}

/// Server side: complete a SUBSCRIBE exchange received on `handle`.
///
/// Returns the client identifier now attached to the connection.
pub async fn accept_subscription(
    handle: &ConnectionHandle,
    mut incoming: IncomingExchange,
    sid: &str,
) -> Result<String> {
    let cid = incoming
        .get(CID)
        .ok_or_else(|| SessionError::Protocol(format!("SUBSCRIBE without {}", CID)))?
        .to_string();
    incoming.drain().await?;

    // The acknowledgement takes its queue slot before the connection becomes
    // visible to broadcasters.
    let mut outgoing = handle.open_outgoing()?;
    outgoing.set_rfi(
        Mode::Subscribe,
        incoming.operation(),
        Parameters::new().with(SID, sid),
    )?;
    handle.set_identity(cid.clone());
    handle.set_subscribed(true);

    outgoing.open().await?;
    outgoing.end().await?;

    info!("Connection {} subscribed as {}", handle.id(), cid);
    Ok(cid)
}
