//! One-time-read payload store
//!
//! Holds results too large for the narrow transport until the client fetches
//! them over the auxiliary server. Every entry can be taken at most once and
//! disappears after its TTL even if nobody reads it.
//!
//! Removal on read and removal on expiry both happen under the same lock, so
//! a concurrent `take` and sweep can never hand out the same bytes twice.
//! Ids are fresh UUIDs and never reused, so a stale id cannot reach a newer
//! entry.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// A stored blob and the content type to serve it with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug)]
struct Slot {
    payload: Payload,
    created_at: Instant,
}

/// TTL-bounded, one-time-retrieval blob cache keyed by UUID
#[derive(Debug)]
pub struct PayloadStore {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl PayloadStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store bytes and return the id they can be taken with
    pub fn put(&self, bytes: Bytes) -> String {
        self.put_payload(Payload {
            bytes,
            content_type: None,
        })
    }

    /// Store bytes with the content type the auxiliary server should report
    pub fn put_typed(&self, bytes: Bytes, content_type: impl Into<String>) -> String {
        self.put_payload(Payload {
            bytes,
            content_type: Some(content_type.into()),
        })
    }

    fn put_payload(&self, payload: Payload) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let size = payload.bytes.len();

        self.slots().insert(
            id.clone(),
            Slot {
                payload,
                created_at: Instant::now(),
            },
        );
        debug!(payload_id = %id, size, "Stored large payload");
        id
    }

    /// Remove and return a payload
    ///
    /// Unknown, expired and already-taken ids are all `NotFound`.
    pub fn take(&self, id: &str) -> Result<Payload> {
        let slot = self
            .slots()
            .remove(id)
            .ok_or_else(|| GatewayError::NotFound(format!("payload {id}")))?;

        if slot.created_at.elapsed() >= self.ttl {
            debug!(payload_id = %id, "Payload expired before read");
            return Err(GatewayError::NotFound(format!("payload {id}")));
        }
        Ok(slot.payload)
    }

    /// Drop every entry whose TTL has elapsed; returns how many were removed
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| slot.created_at.elapsed() < ttl);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `sweep` every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired payloads");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_take_is_one_time() {
        let store = PayloadStore::new(TTL);
        let id = store.put(Bytes::from_static(b"hello"));

        assert_eq!(store.take(&id).unwrap().bytes, Bytes::from_static(b"hello"));
        assert!(matches!(store.take(&id), Err(GatewayError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let store = PayloadStore::new(TTL);
        assert!(matches!(store.take("nope"), Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_content_type_kept() {
        let store = PayloadStore::new(TTL);
        let id = store.put_typed(Bytes::from_static(b"{}"), "application/json");
        assert_eq!(
            store.take(&id).unwrap().content_type.as_deref(),
            Some("application/json")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_not_readable() {
        let store = PayloadStore::new(TTL);
        let id = store.put(Bytes::from_static(b"late"));

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(matches!(store.take(&id), Err(GatewayError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let store = PayloadStore::new(TTL);
        store.put(Bytes::from_static(b"old"));
        tokio::time::advance(Duration::from_secs(45)).await;
        let fresh = store.put(Bytes::from_static(b"fresh"));
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.take(&fresh).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let store = Arc::new(PayloadStore::new(Duration::from_secs(5)));
        let cancel = CancellationToken::new();
        let handle = store.spawn_sweeper(Duration::from_secs(1), cancel.clone());

        store.put(Bytes::from_static(b"x"));
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(store.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_takes_yield_one_winner() {
        let store = Arc::new(PayloadStore::new(TTL));
        for _ in 0..50 {
            let id = store.put(Bytes::from_static(b"contended"));
            let mut tasks = Vec::new();
            for _ in 0..8 {
                let store = Arc::clone(&store);
                let id = id.clone();
                tasks.push(tokio::spawn(async move { store.take(&id).is_ok() }));
            }
            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }
}
