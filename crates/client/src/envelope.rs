//! Wire envelope and frame classification.
//!
//! Every message on the socket is one JSON text frame. Application traffic is
//! an object envelope:
//!
//! ```text
//! {"action":"GET","id":1,"url":"/users/5"}          client -> server
//! {"action":"RES","id":1,"body":{"name":"Ana"}}      server -> client
//! {"action":"SUBSCRIBE","room":"room-a"}             client -> server
//! {"action":"PUBLISH","room":"room-a","data":{..}}   server -> client
//! ```
//!
//! Heartbeats are bare JSON strings: the server sends `"primus::ping::<ts>"`
//! and expects `"primus::pong::<ts>"` back with the same payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// Prefix of a server heartbeat.
pub const HEARTBEAT_PREFIX: &str = "primus::ping::";

/// Envelope action.
///
/// Outgoing requests carry their verb (`GET`, `POST`, ...) as the action, so
/// anything that is not one of the protocol actions is kept as `Verb`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Req,
    Res,
    Publish,
    Subscribe,
    Schema,
    Ping,
    Pong,
    Verb(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Req => "REQ",
            Action::Res => "RES",
            Action::Publish => "PUBLISH",
            Action::Subscribe => "SUBSCRIBE",
            Action::Schema => "SCHEMA",
            Action::Ping => "PING",
            Action::Pong => "PONG",
            Action::Verb(verb) => verb,
        }
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.as_str() {
            "REQ" => Action::Req,
            "RES" => Action::Res,
            "PUBLISH" => Action::Publish,
            "SUBSCRIBE" => Action::Subscribe,
            "SCHEMA" => Action::Schema,
            "PING" => Action::Ping,
            "PONG" => Action::Pong,
            _ => Action::Verb(value),
        }
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        Action::from(value.to_owned())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Verb(verb) => verb,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of a request: a bare url, or a url with a body.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Url(String),
    Target { url: String, body: Option<Value> },
}

impl Query {
    pub fn with_body(url: impl Into<String>, body: Value) -> Self {
        Query::Target {
            url: url.into(),
            body: Some(body),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Query::Url(url) | Query::Target { url, .. } => url,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Query::Url(_) => None,
            Query::Target { body, .. } => body.as_ref(),
        }
    }
}

impl From<&str> for Query {
    fn from(url: &str) -> Self {
        Query::Url(url.to_owned())
    }
}

impl From<String> for Query {
    fn from(url: String) -> Self {
        Query::Url(url)
    }
}

/// One application message on the wire.
///
/// Optional fields are omitted from the encoded JSON when unset. Unknown
/// fields are kept in `extra`, which is also where a `SCHEMA` announcement
/// puts its flattened payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: None,
            url: None,
            body: None,
            room: None,
            data: None,
            reason: None,
            extra: Map::new(),
        }
    }

    /// Request envelope: the verb becomes the action.
    pub fn request(id: u64, verb: &str, query: &Query) -> Self {
        Self {
            id: Some(id),
            url: Some(query.url().to_owned()),
            body: query.body().cloned(),
            ..Self::new(Action::from(verb))
        }
    }

    pub fn response(id: u64, body: Value) -> Self {
        Self {
            id: Some(id),
            body: Some(body),
            ..Self::new(Action::Res)
        }
    }

    pub fn subscribe(room: impl Into<String>) -> Self {
        Self {
            room: Some(room.into()),
            ..Self::new(Action::Subscribe)
        }
    }

    pub fn publish(room: impl Into<String>, data: Value) -> Self {
        Self {
            room: Some(room.into()),
            data: Some(data),
            ..Self::new(Action::Publish)
        }
    }

    /// Announcement sent first on every open. The payload's keys sit at the
    /// top level of the envelope; an `action` key in the payload is dropped.
    pub fn schema(payload: &Map<String, Value>) -> Self {
        let mut extra = payload.clone();
        extra.remove("action");
        Self {
            extra,
            ..Self::new(Action::Schema)
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// `body.reason` when present, otherwise the envelope-level `reason`.
    pub fn reason(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.get("reason"))
            .and_then(Value::as_str)
            .or(self.reason.as_deref())
    }

    /// True when the body carries a truthy `error` field.
    pub fn is_error(&self) -> bool {
        self.body
            .as_ref()
            .and_then(|body| body.get("error"))
            .is_some_and(is_truthy)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// An incoming text frame after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Server heartbeat. Holds the encoded pong to write back.
    Heartbeat(String),
    /// `RES` carrying an id.
    Response(Envelope),
    /// `PUBLISH` carrying a room.
    Publish(Envelope),
    /// Anything else; ignored by the kernel.
    Other(Value),
}

impl Frame {
    /// Classifies one text frame.
    ///
    /// Fails only when the text is not JSON or an object does not decode as
    /// an envelope.
    pub fn classify(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::String(beat) if beat.starts_with(HEARTBEAT_PREFIX) => {
                Ok(Frame::Heartbeat(heartbeat_reply(&beat)?))
            }
            Value::Object(_) => {
                let envelope: Envelope = serde_json::from_value(value)?;
                match envelope.action {
                    Action::Res if envelope.id.is_some() => Ok(Frame::Response(envelope)),
                    Action::Publish if envelope.room.is_some() => Ok(Frame::Publish(envelope)),
                    _ => Ok(Frame::Other(serde_json::to_value(envelope)?)),
                }
            }
            other => Ok(Frame::Other(other)),
        }
    }
}

/// Encodes the pong for a ping string: the first `ping` becomes `pong`.
pub fn heartbeat_reply(ping: &str) -> Result<String> {
    Ok(serde_json::to_string(&ping.replacen("ping", "pong", 1))?)
}
