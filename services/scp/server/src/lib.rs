//! SCP server: accepts connections, answers subscriptions, dispatches calls
//! and pushes broadcasts.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scp_server::Server;
//!
//! # async fn example() -> scp_server::Result<()> {
//! let mut server = Server::new("billing-1");
//! server.reply("sum", |(a, b): (i64, i64)| async move {
//!     Ok::<_, scp_session::RemoteError>(a + b)
//! });
//!
//! let handle = server.bind("127.0.0.1:9000".parse().unwrap()).await?;
//! let delivered = handle.broadcast("ready", &("billing-1",)).await?;
//! println!("announced to {:?}", delivered);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod error;
pub mod server;

pub use error::{Result, ServerError};
pub use server::{Server, ServerConfig, ServerHandle};
