//! Room subscriptions.
//!
//! A room is registered once and lives for the lifetime of the client. On every
//! open the kernel replays one `SUBSCRIBE` per room, in registration order,
//! whether or not the server still remembers it.
//!
//! There is no unsubscribe.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::envelope::Envelope;

/// Callback invoked with the `data` of every `PUBLISH` to its room.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    order: Vec<String>,
    handlers: HashMap<String, Handler>,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("rooms", &self.order)
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `room`.
    ///
    /// A room registered twice keeps its original position; the newer handler
    /// replaces the older one. Returns `true` for a new room.
    pub fn insert(&mut self, room: String, handler: Handler) -> bool {
        let fresh = self.handlers.insert(room.clone(), handler).is_none();
        if fresh {
            debug!(room = %room, "room registered");
            self.order.push(room);
        } else {
            debug!(room = %room, "room handler replaced");
        }
        fresh
    }

    /// Hands a `PUBLISH` to its room's handler.
    ///
    /// A panicking handler is logged and the panic does not propagate.
    /// Returns `false` if nothing was invoked.
    pub fn dispatch(&self, publish: Envelope) -> bool {
        let Some(room) = publish.room.as_deref() else {
            return false;
        };
        let Some(handler) = self.handlers.get(room) else {
            warn!(room, "publish for a room with no subscription");
            return false;
        };

        let data = publish.data.unwrap_or(Value::Null);
        if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
            error!(room, "room handler panicked");
            return false;
        }
        true
    }

    /// One `SUBSCRIBE` per room, in registration order.
    pub fn replay(&self) -> Vec<Envelope> {
        self.order.iter().map(|room| Envelope::subscribe(room.as_str())).collect()
    }
}
