//! What the probe does once the client is up.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_client::Query;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProbeConfig {
    /// Rooms joined before the first request. Each must be non-empty and
    /// listed once.
    #[validate(custom(function = "validate_rooms"))]
    pub rooms: Vec<String>,

    /// Requests issued in order on every round.
    #[validate(nested)]
    pub requests: Vec<ProbeRequest>,

    /// Seconds between rounds. `0` runs a single round.
    #[validate(range(max = 86400, message = "Probe interval must not exceed 86400 seconds"))]
    pub interval_secs: u64,
}

/// One request of a probe round.
///
/// # Examples
/// ```toml
/// [[probe.requests]]
/// verb = "POST"
/// url = "/users"
/// body = { name = "ana" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProbeRequest {
    #[validate(length(min = 1, max = 32, message = "Request verb must be 1 to 32 characters"))]
    pub verb: String,

    #[validate(length(min = 1, message = "Request url must not be empty"))]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ProbeRequest {
    pub fn query(&self) -> Query {
        Query::Target {
            url: self.url.clone(),
            body: self.body.clone(),
        }
    }
}

fn validate_rooms(rooms: &[String]) -> Result<(), ValidationError> {
    for (index, room) in rooms.iter().enumerate() {
        if room.is_empty() {
            let mut err = ValidationError::new("empty_room");
            err.message = Some("Room names must not be empty".into());
            return Err(err);
        }
        if rooms[..index].contains(room) {
            let mut err = ValidationError::new("duplicate_room");
            err.message = Some(format!("Room '{}' is listed more than once", room).into());
            return Err(err);
        }
    }
    Ok(())
}
