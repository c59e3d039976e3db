//! In-flight request correlation
//!
//! Each request/response operation registers its id with a deadline. The
//! handler resolves the entry when it finishes; the waiter gets the result,
//! or a timeout once the deadline passes. A timed-out entry is removed, so a
//! reply that shows up afterwards is dropped instead of answering twice.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::protocol::RequestId;

struct Entry {
    issued_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Result<Value>>,
}

/// Table of requests awaiting a reply, at most one per id
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<RequestId, Entry>>,
}

/// Receiving half handed to whoever answers the client
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestId, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a new request; an id that is still in flight is rejected
    pub fn register(&self, id: &RequestId, timeout: Duration) -> Result<PendingReply> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return Err(GatewayError::validation(format!(
                "request id {id} is already in flight"
            )));
        }

        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        let (reply, rx) = oneshot::channel();
        entries.insert(
            id.clone(),
            Entry {
                issued_at,
                deadline,
                reply,
            },
        );

        Ok(PendingReply {
            id: id.clone(),
            deadline,
            timeout,
            rx,
        })
    }

    /// Deliver a result; returns false when the entry is already gone
    pub fn resolve(&self, id: &RequestId, result: Result<Value>) -> bool {
        let Some(entry) = self.entries().remove(id) else {
            debug!(request_id = %id, "Discarding reply for request that is no longer pending");
            return false;
        };
        debug!(
            request_id = %id,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "Request resolved"
        );
        entry.reply.send(result).is_ok()
    }

    pub fn remove(&self, id: &RequestId) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Fail every pending request; used when the transport goes away
    pub fn reject_all(&self, error: GatewayError) -> usize {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.reply.send(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries().contains_key(id)
    }

    /// Deadline of a pending request, if it is still pending
    pub fn deadline(&self, id: &RequestId) -> Option<Instant> {
        self.entries().get(id).map(|entry| entry.deadline)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PendingReply {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the result or the deadline, whichever comes first
    pub async fn wait(self, table: &PendingRequests) -> Result<Value> {
        match tokio::time::timeout_at(self.deadline, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::transport(format!(
                "request {} was abandoned",
                self.id
            ))),
            Err(_) => {
                table.remove(&self.id);
                Err(GatewayError::Timeout(self.timeout.as_millis() as u64))
            }
        }
    }
}
