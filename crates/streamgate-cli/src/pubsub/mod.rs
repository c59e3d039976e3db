//! Streaming Pub/Sub backend
//!
//! Serves `/event/...` channels. Each subscription runs its own Subscribe
//! stream with pull-based flow control: an initial FetchRequest for a batch
//! of events, then another whenever the server reports that nothing is left
//! pending. Payloads are Avro binary and are decoded with schemas from the
//! shared [`SchemaCache`].
//!
//! Termination is never retried here. An error ends the subscription with a
//! `Failed` item, a clean close with `Ended`.

pub mod client;
pub mod proto;

use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use streamgate_core::replay::replay_id_to_json;
use streamgate_core::{
    BackendRequest, CachedSchema, Credential, GatewayError, Protocol, ReplayMarker, Result,
    SchemaCache, StreamBackend, StreamEvent, StreamItem,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use client::{GrpcPubSub, PubSubApi};
use proto::{ConsumerEvent, FetchRequest, ReplayPreset};

/// [`StreamBackend`] for the Pub/Sub API
pub struct PubSubBackend {
    api: Arc<dyn PubSubApi>,
    schemas: Arc<SchemaCache>,
    batch_size: i32,
    queue_depth: usize,
}

impl PubSubBackend {
    pub fn new(
        api: Arc<dyn PubSubApi>,
        schemas: Arc<SchemaCache>,
        batch_size: i32,
        queue_depth: usize,
    ) -> Self {
        Self {
            api,
            schemas,
            batch_size,
            queue_depth,
        }
    }
}

impl StreamBackend for PubSubBackend {
    fn open(&self, request: BackendRequest) -> Result<mpsc::Receiver<StreamItem>> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let subscription = Subscription {
            api: Arc::clone(&self.api),
            schemas: Arc::clone(&self.schemas),
            batch_size: self.batch_size,
            request,
            events: tx,
        };
        tokio::spawn(subscription.run());
        Ok(rx)
    }
}

struct Subscription {
    api: Arc<dyn PubSubApi>,
    schemas: Arc<SchemaCache>,
    batch_size: i32,
    request: BackendRequest,
    events: mpsc::Sender<StreamItem>,
}

impl Subscription {
    async fn run(self) {
        let cancel = self.request.cancel.clone();
        let subscription_id = self.request.subscription_id.clone();

        let terminal = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%subscription_id, "Pub/Sub stream cancelled");
                return;
            }
            outcome = self.stream() => match outcome {
                Ok(reason) => StreamItem::Ended(reason),
                Err(error) => StreamItem::Failed(error),
            },
        };

        let _ = self.events.send(terminal).await;
    }

    /// Pump events until the server closes the stream or something fails
    async fn stream(&self) -> Result<Option<String>> {
        let topic = &self.request.route.name;
        let credential = &self.request.credential;

        let (fetch_tx, fetch_rx) = mpsc::channel(4);
        fetch_tx
            .send(initial_fetch(topic, self.request.replay, self.batch_size))
            .await
            .map_err(|_| GatewayError::upstream("Subscribe request stream closed"))?;

        let mut responses = self.api.subscribe(credential, fetch_rx).await?;
        info!(
            subscription_id = %self.request.subscription_id,
            topic = %topic,
            replay = %self.request.replay,
            "Pub/Sub stream open"
        );

        while let Some(response) = responses.next().await {
            let response = response?;
            debug!(
                topic = %topic,
                events = response.events.len(),
                pending = response.pending_num_requested,
                "FetchResponse"
            );

            for consumer_event in response.events {
                let event = self.decode(consumer_event).await?;
                if self.events.send(StreamItem::Event(event)).await.is_err() {
                    // Registry dropped the receiver; nobody is listening
                    return Ok(None);
                }
            }

            if response.pending_num_requested == 0 {
                let more = FetchRequest {
                    topic_name: topic.clone(),
                    num_requested: self.batch_size,
                    ..Default::default()
                };
                if fetch_tx.send(more).await.is_err() {
                    warn!(topic = %topic, "Subscribe request stream closed before refill");
                    break;
                }
            }
        }

        Ok(Some("platform closed the stream".to_string()))
    }

    async fn decode(&self, consumer_event: ConsumerEvent) -> Result<StreamEvent> {
        let producer = consumer_event
            .event
            .ok_or_else(|| GatewayError::upstream("ConsumerEvent without an event"))?;
        let schema = fetch_schema(
            &self.api,
            &self.schemas,
            &self.request.credential,
            &producer.schema_id,
        )
        .await?;
        let payload = schema.decode(&producer.payload)?;

        Ok(StreamEvent {
            channel: self.request.route.name.clone(),
            protocol: Protocol::PubSub,
            replay_id: replay_id_to_json(&consumer_event.replay_id),
            payload,
            schema_id: Some(producer.schema_id),
            event_id: (!producer.id.is_empty()).then_some(producer.id),
        })
    }
}

/// Resolve a schema through the cache, fetching it from the API on first use
pub async fn fetch_schema(
    api: &Arc<dyn PubSubApi>,
    schemas: &SchemaCache,
    credential: &Credential,
    schema_id: &str,
) -> Result<Arc<CachedSchema>> {
    schemas
        .get_or_fetch(schema_id, || async {
            let info = api.get_schema(credential, schema_id).await?;
            Ok(info.schema_json)
        })
        .await
}

/// The first FetchRequest of a stream carries the topic and replay position
fn initial_fetch(topic: &str, replay: ReplayMarker, batch_size: i32) -> FetchRequest {
    let (preset, replay_id) = match replay {
        ReplayMarker::Latest => (ReplayPreset::Latest, Vec::new()),
        ReplayMarker::Earliest => (ReplayPreset::Earliest, Vec::new()),
        ReplayMarker::Offset(_) => (
            ReplayPreset::Custom,
            replay.replay_id_bytes().unwrap_or_default(),
        ),
    };
    FetchRequest {
        topic_name: topic.to_string(),
        replay_preset: preset as i32,
        replay_id,
        num_requested: batch_size,
        auth_refresh: String::new(),
    }
}

/// JSON rendering of a topic for `getTopic`
pub fn topic_json(topic: &proto::TopicInfo) -> Value {
    json!({
        "topicName": topic.topic_name,
        "tenantGuid": topic.tenant_guid,
        "canPublish": topic.can_publish,
        "canSubscribe": topic.can_subscribe,
        "schemaId": topic.schema_id,
        "rpcId": topic.rpc_id,
    })
}
