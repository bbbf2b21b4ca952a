//! SCP client.
//!
//! A [`Client`] keeps one subscription connection to a server and delivers
//! BROADCAST exchanges to listeners registered with [`Client::on`]. Calls
//! made with [`Client::message`], [`Client::execute`] and [`Client::conduct`]
//! each use a dedicated short-lived connection.
//!
//! ## Example
//!
//! ```rust,no_run
//! use scp_client::Client;
//!
//! # async fn example() -> scp_client::Result<()> {
//! let client = Client::new("dashboard-1");
//! client.on("tick", |args| println!("tick {:?}", args));
//! client.connect("127.0.0.1:9000".parse().unwrap()).await?;
//!
//! let total: i64 = client.execute("sum", &(2, 3)).await?;
//! println!("2 + 3 = {}", total);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;

pub use client::{Client, ClientConfig, Listener};
pub use error::{ClientError, Result};
