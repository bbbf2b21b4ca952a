//! Transport streams, exchanges and connections for SCP.
//!
//! This crate turns a raw bidirectional socket into a sequence of exchanges.
//! Every exchange is an RFI followed by data and signal frames and closed by
//! an END frame. A [`Connection`] runs one reader task and one writer task;
//! outgoing exchanges are written strictly one after the other in the order
//! they were opened.
//!
//! ## Features
//!
//! - **Transport**: TCP listener and dialer, optional TLS (`tls` feature)
//! - **Exchanges**: RFI-once writes, transparent frame splitting, backpressure
//! - **Subscription**: the SUBSCRIBE round-trip used by clients and servers
//! - **Conductor**: multi-step payload and signal exchange inside one call
//! - **Heartbeats**: zero-length frames on idle connections
//!
//! ## Example
//!
//! ```rust,no_run
//! use scp_session::{connect_tcp, Connection, ConnectionConfig, IoStream};
//! use scp_wire::{Mode, Parameters};
//!
//! # async fn example() -> scp_session::Result<()> {
//! let addr = "127.0.0.1:9000".parse().unwrap();
//! let stream = connect_tcp(addr).await?;
//! let mut connection = Connection::from_io(IoStream::Plain(stream), ConnectionConfig::default());
//!
//! let mut call = connection.open_outgoing()?;
//! call.set_rfi(Mode::Reply, "echo", Parameters::new())?;
//! call.write(r#"["hello"]"#).await?;
//! call.end().await?;
//!
//! if let Some(mut reply) = connection.accept().await {
//!     let body = reply.read_to_end().await?;
//!     println!("{} -> {}", reply.rfi(), String::from_utf8_lossy(&body));
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conductor;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod handshake;
pub mod payload;
pub mod transport;

pub use conductor::{Conductor, ConductorEvent, Coordinator, PAYLOAD_END, PAYLOAD_START};
pub use connection::{Connection, ConnectionConfig, ConnectionHandle, ConnectionStats};
pub use error::{Result, SessionError};
pub use exchange::{Chunk, IncomingExchange, OutgoingExchange};
pub use handshake::{accept_subscription, subscribe, SUBSCRIBE_OPERATION};
pub use payload::{
    decode_args, decode_error, decode_reply, encode_args, encode_value, RemoteError,
};
pub use transport::{connect_tcp, listen_tcp, FrameReader, FrameWriter, IoStream, TlsClientConfig};

#[cfg(feature = "tls")]
pub use transport::tls;
