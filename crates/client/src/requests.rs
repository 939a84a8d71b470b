//! In-flight request bookkeeping.
//!
//! The registry hands out request ids, remembers what each request asked for,
//! and completes the caller's oneshot when the matching `RES` arrives. It is
//! owned by the connection kernel and never shared.
//!
//! Ids start at 1, grow by one per registration and are never reused, not even
//! across reconnects: a replayed request gets a fresh id while keeping its
//! original caller.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::envelope::{Envelope, Query};
use crate::error::ClientError;
use crate::Result;

/// Completion handle of one caller.
pub type Responder = oneshot::Sender<Result<Envelope>>;

/// A request that has been registered and not yet answered.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub verb: String,
    pub query: Query,
    responder: Responder,
}

#[derive(Debug)]
pub struct RequestRegistry {
    next_id: u64,
    pending: BTreeMap<u64, PendingRequest>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Records a request and returns the envelope to transmit.
    ///
    /// Entries whose caller has gone away are dropped first, so a node that
    /// never answers an abandoned request does not keep it alive.
    pub fn register(&mut self, verb: String, query: Query, responder: Responder) -> Envelope {
        self.prune_abandoned();
        let id = self.allocate();
        let envelope = Envelope::request(id, &verb, &query);
        debug!(id, verb = %verb, url = query.url(), "request registered");
        self.pending.insert(
            id,
            PendingRequest {
                id,
                verb,
                query,
                responder,
            },
        );
        envelope
    }

    fn prune_abandoned(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, request| !request.responder.is_closed());
        let pruned = before - self.pending.len();
        if pruned > 0 {
            debug!(pruned, "abandoned requests dropped");
        }
    }

    /// Completes the request matching `response.id` with the full envelope.
    ///
    /// Returns `false` for unknown or already resolved ids.
    pub fn resolve(&mut self, response: Envelope) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        match self.pending.remove(&id) {
            Some(request) => {
                trace!(id, "request resolved");
                // the caller may have given up; nothing to do then
                let _ = request.responder.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Removes a request and fails its caller.
    pub fn reject(&mut self, id: u64, err: ClientError) -> bool {
        match self.pending.remove(&id) {
            Some(request) => {
                let _ = request.responder.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Moves every unresolved request to a new id, in registration order, and
    /// returns the envelopes to resend. Callers that went away are dropped.
    pub fn replay(&mut self) -> Vec<Envelope> {
        let previous = std::mem::take(&mut self.pending);
        let mut envelopes = Vec::with_capacity(previous.len());

        for (old_id, request) in previous {
            if request.responder.is_closed() {
                debug!(id = old_id, "caller gone, request not replayed");
                continue;
            }
            let id = self.allocate();
            debug!(old_id, id, verb = %request.verb, "request replayed");
            envelopes.push(Envelope::request(id, &request.verb, &request.query));
            self.pending.insert(id, PendingRequest { id, ..request });
        }
        envelopes
    }

    /// Fails every pending request; `make_err` builds one error per caller.
    pub fn fail_all(&mut self, make_err: impl Fn() -> ClientError) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for request in pending.into_values() {
            let _ = request.responder.send(Err(make_err()));
        }
        count
    }

    #[cfg(test)]
    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Ids currently awaiting a response, ascending.
    #[cfg(test)]
    pub fn ids(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }
}
