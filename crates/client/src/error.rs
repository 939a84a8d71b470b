//! Error types for the tether client.
//!
//! `ClientError` is the single error type returned by every public operation.
//! The variants split into three groups:
//!
//! **Surfaced to request callers**:
//! - `Remote`: the server answered, and the body carries `error`
//! - `SendFailure`: the request could not be written to the socket
//! - `RetryWindowExceeded`: a timed-out request kept failing until the retry window closed
//! - `RetriesPolicy`: the reconnect budget ran out
//! - `Closed`: the client was shut down while the call was pending
//!
//! **Setup**:
//! - `ConfigError`, `InvalidHeader`
//!
//! **Internal to the connection kernel**:
//! - `Transport`, `ConnectionLost`, `Codec`. These trigger a reconnect (or, for
//!   undecodable frames, a log line). Callers never see them, because their
//!   requests are replayed once the socket comes back.
//!
//! # Usage
//!
//! ```ignore
//! match client.request("GET", "/users/5").await {
//!     Ok(body) => println!("user: {body}"),
//!     Err(ClientError::Remote(remote)) => eprintln!("server refused: {remote}"),
//!     Err(ClientError::RetryWindowExceeded) => eprintln!("node kept timing out"),
//!     Err(e) => eprintln!("request failed: {e}"),
//! }
//! ```

use std::fmt;

use thiserror::Error;

use crate::backoff::BackoffError;
use crate::envelope::Envelope;

/// Error response returned by the remote node.
///
/// Carries the full response envelope so callers can inspect `body.reason`,
/// custom error codes or anything else the node attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub envelope: Envelope,
}

impl RemoteError {
    /// The `reason` attached to the error body, if any.
    pub fn reason(&self) -> Option<&str> {
        self.envelope.reason()
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.envelope.id, self.reason()) {
            (Some(id), Some(reason)) => write!(f, "request {id} failed: {reason}"),
            (Some(id), None) => write!(f, "request {id} failed"),
            (None, Some(reason)) => write!(f, "request failed: {reason}"),
            (None, None) => f.write_str("request failed"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// The unified error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// WebSocket-level failure reported by tungstenite.
    ///
    /// Boxed to keep the enum small.
    #[error("Transport error: {0}")]
    Transport(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// The socket closed, timed out or was refused without a tungstenite error.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The node answered with an error body. Never retried.
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// Writing the request to the socket failed.
    ///
    /// The request is removed from the registry before this is returned, so it
    /// is not replayed on reconnect.
    #[error("Send failure: {0}")]
    SendFailure(String),

    /// The request kept timing out until the retry window closed.
    #[error("Retry window exceeded")]
    RetryWindowExceeded,

    /// Reconnect attempts exhausted.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] BackoffError),

    /// JSON encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Configuration validation failed.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The access token cannot be carried in an HTTP header.
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    /// The client was shut down, or its kernel task is gone.
    #[error("Client closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(Box::new(err))
    }
}

impl ClientError {
    /// True for failures the kernel recovers from by reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::ConnectionLost(_)
        )
    }
}
