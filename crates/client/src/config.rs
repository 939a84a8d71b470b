//! Client configuration.
//!
//! `ClientConfig` deserializes from any serde format (the `tether` binary reads
//! it from the `[client]` table of its TOML file) and is validated with the
//! `validator` crate before a client is built, so a bad value fails at startup
//! rather than on the first request.
//!
//! # Timing
//!
//! Every duration is in milliseconds:
//!
//! | field | default | meaning |
//! |---|---|---|
//! | `connect_timeout_ms` | 500 | watchdog on a single open attempt |
//! | `retry_delay_ms` | 500 | retry delay when the response carries no delay hint |
//! | `retry_window_ms` | 5000 | total time one call may spend retrying |
//! | `reconnect_delay_ms` | 500 | second reconnect delay (the first is immediate); also how long a socket must stay open before the schedule restarts |
//! | `reconnect_max_delay_ms` | 5000 | cap on the reconnect delay |
//!
//! # Examples
//!
//! ```ignore
//! let config: ClientConfig = toml::from_str(r#"
//!     url = "ws://node.local:3000"
//!     access_token = "secret"
//!     connect_timeout_ms = 5000
//! "#)?;
//! config.validate()?;
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::transport::OpenRequest;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_reconnect_window"))]
pub struct ClientConfig {
    /// WebSocket endpoint of the remote node.
    ///
    /// # Validation
    /// - Must start with `ws://`
    /// - Length: up to 2048 characters
    ///
    /// # Examples
    /// ```toml
    /// url = "ws://127.0.0.1:3000"
    /// ```
    #[validate(
        length(max = 2048, message = "Endpoint url must not exceed 2048 characters"),
        custom(function = "validate_endpoint")
    )]
    pub url: String,

    /// Token sent as `Authorization: bearer <token>` when the socket opens.
    ///
    /// Acquiring the token is up to the application.
    #[validate(length(min = 1, message = "Access token must not be empty"))]
    pub access_token: Option<String>,

    /// Identifier carried on every log line of this client.
    ///
    /// Defaults to a random v4 uuid.
    #[validate(length(
        min = 1,
        max = 128,
        message = "Client id must be between 1 and 128 characters"
    ))]
    pub client_id: String,

    /// Watchdog on one open attempt. If the socket has not opened in time the
    /// attempt is abandoned and the reconnect schedule takes over.
    #[validate(range(
        min = 50,
        max = 60000,
        message = "Connect timeout must be between 50 and 60000 ms"
    ))]
    pub connect_timeout_ms: u64,

    /// Retry delay used when a timed-out response carries no parsable delay.
    #[validate(range(
        min = 1,
        max = 60000,
        message = "Retry delay must be between 1 and 60000 ms"
    ))]
    pub retry_delay_ms: u64,

    /// Upper bound on the time one call spends in retries, counted from its
    /// first retry.
    #[validate(range(
        min = 100,
        max = 600000,
        message = "Retry window must be between 100 and 600000 ms"
    ))]
    pub retry_window_ms: u64,

    /// Delay before the second reconnect attempt of an outage. A socket that
    /// stays open this long counts as recovered and restarts the schedule.
    #[validate(range(
        min = 10,
        max = 60000,
        message = "Reconnect delay must be between 10 and 60000 ms"
    ))]
    pub reconnect_delay_ms: u64,

    #[validate(range(
        min = 10,
        max = 600000,
        message = "Reconnect max delay must be between 10 and 600000 ms"
    ))]
    pub reconnect_max_delay_ms: u64,

    /// Growth factor of the reconnect delay.
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Reconnect backoff multiplier must be between 1.0 and 10.0"
    ))]
    pub reconnect_backoff_multiplier: f64,

    /// Reconnect attempts per outage before pending work is failed.
    /// `0` means unlimited.
    #[validate(range(max = 100000, message = "Max reconnect attempts must not exceed 100000"))]
    pub max_reconnect_attempts: u32,

    /// Capacity of the command channel between client handles and the kernel.
    #[validate(range(
        min = 1,
        max = 65536,
        message = "Command channel capacity must be between 1 and 65536"
    ))]
    pub command_channel_capacity: usize,

    /// Announcement sent as a `SCHEMA` envelope first on every open.
    ///
    /// # Examples
    /// ```toml
    /// [client.schema]
    /// name = "inventory-worker"
    /// routes = ["/items", "/items/:id"]
    /// ```
    pub schema: Option<Map<String, Value>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000".to_string(),
            access_token: None,
            client_id: Uuid::new_v4().to_string(),
            connect_timeout_ms: 500,
            retry_delay_ms: 500,
            retry_window_ms: 5000,
            reconnect_delay_ms: 500,
            reconnect_max_delay_ms: 5000,
            reconnect_backoff_multiplier: 2.0,
            max_reconnect_attempts: 0,
            command_channel_capacity: 64,
            schema: None,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.retry_window_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// What the connector needs to open a socket.
    pub fn open_request(&self) -> OpenRequest {
        OpenRequest {
            url: self.url.clone(),
            bearer: self.access_token.clone(),
        }
    }
}

/// Only plain `ws://` endpoints: the transport is built without TLS.
fn validate_endpoint(url: &str) -> Result<(), ValidationError> {
    let Some(rest) = url.strip_prefix("ws://") else {
        return Err(ValidationError::new("invalid_scheme")
            .with_message("Endpoint url must start with ws://".into()));
    };
    if rest.is_empty() || rest.starts_with('/') {
        return Err(ValidationError::new("missing_host")
            .with_message("Endpoint url must name a host".into()));
    }
    Ok(())
}

fn validate_reconnect_window(config: &ClientConfig) -> Result<(), ValidationError> {
    if config.reconnect_max_delay_ms < config.reconnect_delay_ms {
        return Err(ValidationError::new("reconnect_window")
            .with_message("Reconnect max delay must not be below the reconnect delay".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout(), Duration::from_millis(500));
        assert_eq!(config.retry_window(), Duration::from_secs(5));
        assert!(Uuid::parse_str(&config.client_id).is_ok());
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(
            ClientConfig::default().client_id,
            ClientConfig::default().client_id
        );
    }

    #[test]
    fn test_rejects_non_ws_scheme() {
        for url in ["http://node:3000", "wss://node:3000", "", "ws://"] {
            let config = ClientConfig::new(url);
            assert!(config.validate().is_err(), "{url} should be rejected");
        }
    }

    #[test]
    fn test_rejects_out_of_range_timing() {
        let config = ClientConfig {
            connect_timeout_ms: 10,
            ..ClientConfig::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("connect_timeout_ms"));

        let config = ClientConfig {
            reconnect_backoff_multiplier: 0.5,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_reconnect_window() {
        let config = ClientConfig {
            reconnect_delay_ms: 2000,
            reconnect_max_delay_ms: 1000,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_token() {
        let config = ClientConfig::default().with_access_token("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            url = "ws://node.local:3000"
            access_token = "secret"
            retry_window_ms = 8000

            [schema]
            name = "worker"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_window_ms, 8000);
        assert_eq!(config.retry_delay_ms, 500);
        assert_eq!(
            config.schema.unwrap().get("name"),
            Some(&Value::String("worker".into()))
        );

        let open = ClientConfig::new("ws://a:1").with_access_token("t").open_request();
        assert_eq!(open.bearer.as_deref(), Some("t"));
    }
}
