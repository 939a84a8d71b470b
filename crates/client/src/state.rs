//! Connection state tracking.
//!
//! The connection kernel is the only writer of the state. It publishes every
//! transition through a `tokio::sync::watch` channel, so application code can
//! observe it through [`Client::subscribe_state`](crate::Client::subscribe_state).
//!
//! # Examples
//!
//! ```ignore
//! let mut states = client.subscribe_state();
//! while states.changed().await.is_ok() {
//!     println!("link: {}", *states.borrow());  // "Disconnected (socket closed)"
//! }
//! ```

use std::fmt;

/// Current state of the client's socket.
///
/// Lifecycle:
/// - `Disconnected` -> `Connecting` (first `connect()`, or backoff elapsed)
/// - `Connecting` -> `Connected` (socket opened)
/// - `Connecting` -> `Disconnected` (refused, or the open watchdog fired)
/// - `Connected` -> `Disconnected` (socket closed or errored)
///
/// Requests issued outside `Connected` are held and go out on the next open.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// An open attempt is in flight.
    Connecting,

    /// The socket is open. Registries have been replayed and new requests go
    /// straight to the wire.
    Connected,

    /// No usable socket.
    ///
    /// The `String` carries the reason: `"not connected"` before the first
    /// attempt, the close or error text after a drop, or the exhausted backoff
    /// budget.
    Disconnected(String),
}

impl ConnectionState {
    /// Short static name, for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
        }
    }

    /// Disconnect reason, empty for the other states.
    pub fn details(&self) -> &str {
        match self {
            ConnectionState::Disconnected(reason) => reason,
            _ => "",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected("not connected".into())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Connecting.as_str(), "Connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(
            ConnectionState::Disconnected("closed".into()).as_str(),
            "Disconnected"
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Disconnected("socket closed".into()).to_string(),
            "Disconnected (socket closed)"
        );
        assert_eq!(
            ConnectionState::Disconnected(String::new()).to_string(),
            "Disconnected"
        );
    }

    #[test]
    fn test_default_is_disconnected() {
        let state = ConnectionState::default();
        assert!(state.is_disconnected());
        assert_eq!(state.details(), "not connected");
    }

    #[test]
    fn test_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(!ConnectionState::Disconnected("x".into()).is_connecting());
    }
}
