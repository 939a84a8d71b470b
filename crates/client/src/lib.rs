//! # tether-client: resilient WebSocket request/subscribe client
//!
//! Keeps one long-lived socket to a remote node and lets the application
//! issue request/response calls and receive server pushes over it. Connection
//! loss does not lose work:
//!
//! - **Reconnect with backoff**: an immediate first attempt, then exponential
//!   delays up to a cap, plus an open watchdog for attempts that silently stall
//! - **Request replay**: every unanswered request is resent after a reconnect,
//!   in its original order, and its caller still gets the answer
//! - **Room replay**: every subscribed room is joined again on each open
//! - **Timed-out retry**: responses that report a node-side timeout are
//!   re-issued after the delay the node asks for, inside a bounded window
//! - **Heartbeats**: `primus::ping::<ts>` is answered with `primus::pong::<ts>`
//!
//! # Quick Start
//!
//! ```ignore
//! use tether_client::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tether_client::ClientError> {
//!     let client = Client::new(
//!         ClientConfig::new("ws://127.0.0.1:3000").with_access_token("secret"),
//!     )?;
//!
//!     client.subscribe("room-a", |data| println!("room-a: {data}")).await?;
//!     let user = client.request("GET", "/users/5").await?;
//!     println!("user: {user}");
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Client (cloneable handle)            │
//! │ connect / request / subscribe        │
//! └───────┬───────────────────┬──────────┘
//!         │ commands          │ timed-out responses
//! ┌───────▼──────────┐  ┌─────▼──────────┐
//! │ ConnectionKernel │◄─┤ RetryScheduler │
//! │ requests, rooms, │  └────────────────┘
//! │ backoff, state   │
//! └───────┬──────────┘
//!         │ Connector / Socket
//! ┌───────▼──────────────────────────────┐
//! │ WsConnector (tokio-tungstenite)      │
//! └──────────────────────────────────────┘
//! ```
//!
//! # Wire format
//!
//! See [`envelope`] for the JSON envelope carried in every text frame.

pub mod backoff;
pub mod client;
pub mod config;
mod connection;
pub mod envelope;
pub mod error;
pub mod requests;
pub mod retry;
pub mod state;
pub mod subscriptions;
pub mod transport;

pub use backoff::{Backoff, BackoffError};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use envelope::{Action, Envelope, Frame, Query};
pub use error::{ClientError, RemoteError};
pub use state::ConnectionState;
pub use transport::{Connector, OpenRequest, Socket, WsConnector};

/// Result type of every fallible client operation.
pub type Result<T> = std::result::Result<T, ClientError>;
