//! Request/response correlation.
//!
//! Each outbound request registers a one-shot slot under a fresh id. The
//! reader fills the slot when the matching response arrives; the caller
//! removes it on timeout or cancellation. Whichever side gets there first
//! removes the entry, so every slot leaves the table exactly once.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::rpc::message::ResponseOutcome;
use crate::{AppError, Result};

/// Receiving half of a pending slot.
pub type ResponseSlot = oneshot::Receiver<Result<Value>>;

/// One in-flight request.
#[derive(Debug)]
struct PendingRequest {
    tx: oneshot::Sender<Result<Value>>,
}

/// Pending table plus the id → owner map used for event routing.
///
/// Ids come from one counter for the bridge's whole lifetime, so they keep
/// increasing across process restarts.
#[derive(Debug)]
pub struct Correlator {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    owners: HashMap<u64, String>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Empty table; the first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            owners: HashMap::new(),
        }
    }

    /// Allocate an id and its slot, tagging it with `owner` when given.
    pub fn register(&mut self, owner: Option<&str>) -> (u64, ResponseSlot) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingRequest { tx });
        if let Some(owner) = owner {
            self.owners.insert(id, owner.to_owned());
        }
        (id, rx)
    }

    /// Fill and remove the slot for `id`.
    ///
    /// Returns `false` if nothing was waiting (already timed out, cancelled,
    /// or never registered).
    pub fn deliver(&mut self, id: u64, outcome: Result<Value>) -> bool {
        let Some(entry) = self.pending.remove(&id) else {
            return false;
        };
        // A dropped receiver means the caller stopped waiting in the
        // meantime; the entry is gone either way.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Remove the slot for `id` without filling it.
    pub fn remove(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Owner tagged on request `id`.
    ///
    /// Tags outlive the response: the agent may still emit events for a
    /// request after answering it.
    #[must_use]
    pub fn owner_of(&self, id: u64) -> Option<&str> {
        self.owners.get(&id).map(String::as_str)
    }

    /// Fail every pending slot with `reason` and forget all owner tags.
    ///
    /// Returns how many callers were woken.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        self.owners.clear();
        let drained: Vec<_> = self.pending.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(AppError::Write(reason.to_owned())));
        }
        count
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Id the next [`register`](Self::register) will hand out.
    #[must_use]
    pub fn peek_next_id(&self) -> u64 {
        self.next_id
    }
}

/// Turn a response into what the waiting caller receives.
///
/// A standard error object becomes [`AppError::Protocol`]; an error of any
/// other shape is handed back as the result `{"error": <raw>}`.
#[must_use]
pub fn outcome_to_result(outcome: ResponseOutcome) -> Result<Value> {
    match outcome {
        ResponseOutcome::Result(value) => Ok(value),
        ResponseOutcome::Error(err) => Err(AppError::Protocol(format!(
            "{} (code {})",
            err.message, err.code
        ))),
        ResponseOutcome::MalformedError(raw) => Ok(json!({ "error": raw })),
    }
}
