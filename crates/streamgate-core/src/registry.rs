//! Subscription registry
//!
//! The single source of truth for what is currently streaming. Each entry
//! owns the cancellation token of one backend stream; a forwarder task per
//! subscription relays that stream's items to the client in order.
//!
//! Entries leave the registry in exactly three ways: an explicit `cancel`,
//! `cancel_all` on transport loss, or a terminal item from the backend. In
//! every case the token is cancelled, so the backend resource never outlives
//! its entry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{select_protocol, ChannelRoute, Protocol};
use crate::credential::Credential;
use crate::error::{GatewayError, Result};
use crate::outbound::Outbound;
use crate::protocol::{PushFrame, SubscribeResult};
use crate::replay::ReplayMarker;
use crate::stream::StreamItem;

/// Everything a backend needs to open one subscription
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub subscription_id: String,
    pub route: ChannelRoute,
    pub credential: Credential,
    pub replay: ReplayMarker,
    /// Fires when the subscription is cancelled; the backend must release
    /// its resources once it does
    pub cancel: CancellationToken,
}

/// A streaming backend: turns a subscription request into a stream of items
///
/// `open` must not block; connection work happens in tasks the backend
/// spawns. Failures after `open` returns are reported as a terminal
/// [`StreamItem::Failed`].
pub trait StreamBackend: Send + Sync {
    fn open(&self, request: BackendRequest) -> Result<mpsc::Receiver<StreamItem>>;
}

/// Registry view of one active subscription
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub id: String,
    pub channel: String,
    pub protocol: Protocol,
    pub org_id: String,
    pub replay: ReplayMarker,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    info: SubscriptionInfo,
    cancel: CancellationToken,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SubscriptionRegistry {
    pubsub: Arc<dyn StreamBackend>,
    cometd: Arc<dyn StreamBackend>,
    entries: Entries,
    outbound: Outbound,
}

impl SubscriptionRegistry {
    pub fn new(
        pubsub: Arc<dyn StreamBackend>,
        cometd: Arc<dyn StreamBackend>,
        outbound: Outbound,
    ) -> Self {
        Self {
            pubsub,
            cometd,
            entries: Arc::new(Mutex::new(HashMap::new())),
            outbound,
        }
    }

    fn backend(&self, protocol: Protocol) -> &Arc<dyn StreamBackend> {
        match protocol {
            Protocol::PubSub => &self.pubsub,
            Protocol::CometD => &self.cometd,
        }
    }

    /// Route a channel to its backend, open the stream and start forwarding
    ///
    /// Routing errors surface here, before any connection is attempted.
    pub fn create(
        &self,
        channel: &str,
        credential: Credential,
        replay: ReplayMarker,
    ) -> Result<SubscribeResult> {
        let route = select_protocol(channel)?;
        let subscription_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let info = SubscriptionInfo {
            id: subscription_id.clone(),
            channel: route.name.clone(),
            protocol: route.protocol,
            org_id: credential.org_id().to_string(),
            replay,
            created_at: Utc::now(),
        };

        let events = self.backend(route.protocol).open(BackendRequest {
            subscription_id: subscription_id.clone(),
            route: route.clone(),
            credential,
            replay,
            cancel: cancel.clone(),
        })?;

        lock(&self.entries).insert(
            subscription_id.clone(),
            Entry {
                info,
                cancel: cancel.clone(),
            },
        );
        info!(
            subscription_id = %subscription_id,
            channel = %route.name,
            protocol = %route.protocol,
            replay = %replay,
            "Subscription created"
        );

        tokio::spawn(forward(
            subscription_id.clone(),
            events,
            cancel,
            Arc::clone(&self.entries),
            self.outbound.clone(),
        ));

        Ok(SubscribeResult {
            subscription_id,
            channel: route.name,
            protocol: route.protocol,
        })
    }

    /// Stop a subscription; unknown ids are a no-op and return false
    pub fn cancel(&self, subscription_id: &str) -> bool {
        match lock(&self.entries).remove(subscription_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(subscription_id, "Subscription cancelled");
                true
            }
            None => {
                debug!(subscription_id, "Cancel for unknown subscription ignored");
                false
            }
        }
    }

    /// Stop every subscription; safe with none active
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = lock(&self.entries).drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Cancelled all subscriptions");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<SubscriptionInfo> {
        lock(&self.entries)
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }
}

/// Relay one subscription's items to the client until it ends or is cancelled
async fn forward(
    subscription_id: String,
    mut events: mpsc::Receiver<StreamItem>,
    cancel: CancellationToken,
    entries: Entries,
    outbound: Outbound,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = events.recv() => item,
        };

        let terminal = match item {
            Some(StreamItem::Event(event)) => match serde_json::to_value(&event) {
                Ok(value) => {
                    if outbound.push(PushFrame::event(&subscription_id, value)).await.is_err() {
                        // Writer is gone; the host loop tears everything down
                        return;
                    }
                    continue;
                }
                Err(e) => PushFrame::error(
                    &subscription_id,
                    &GatewayError::upstream(format!("event could not be encoded: {e}")),
                ),
            },
            Some(StreamItem::Failed(error)) => {
                warn!(subscription_id = %subscription_id, %error, "Subscription failed");
                PushFrame::error(&subscription_id, &error)
            }
            Some(StreamItem::Ended(reason)) => PushFrame::end(&subscription_id, reason),
            None => PushFrame::end(&subscription_id, Some("stream closed".to_string())),
        };

        // Only report the end if nobody cancelled the entry in the meantime
        let removed = lock(&entries).remove(&subscription_id).is_some();
        cancel.cancel();
        if removed {
            info!(subscription_id = %subscription_id, "Subscription ended by backend");
            let _ = outbound.push(terminal).await;
        }
        return;
    }
}
