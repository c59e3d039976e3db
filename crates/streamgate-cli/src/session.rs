//! Per-process gateway session
//!
//! Owns every long-lived component: payload store, schema cache, both
//! protocol backends, the subscription registry, the pending-request table
//! and the auxiliary server. There is exactly one session per process, tied
//! to the lifetime of the narrow transport.

use bytes::Bytes;
use std::sync::Arc;
use streamgate_core::config::GatewayConfig;
use streamgate_core::protocol::{InitResult, PingResult};
use streamgate_core::{
    GatewayError, Outbound, PayloadStore, PendingRequests, Result, SchemaCache,
    SubscriptionRegistry, GATEWAY_VERSION,
};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aux_server::{self, AuxServerHandle};
use crate::cometd::{CometdBackend, CometdPool, HttpTransportFactory, TransportFactory};
use crate::pubsub::{GrpcPubSub, PubSubApi, PubSubBackend};
use crate::relay::Relay;

/// Network-facing clients the session builds its backends from
pub struct Backends {
    pub pubsub: Arc<dyn PubSubApi>,
    pub bayeux: Arc<dyn TransportFactory>,
}

impl Backends {
    /// The real gRPC and HTTP clients
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            pubsub: Arc::new(GrpcPubSub::new(config.platform.pubsub_endpoint.clone())),
            bayeux: Arc::new(HttpTransportFactory::new(config.platform.api_version.clone())),
        }
    }
}

pub struct Session {
    config: GatewayConfig,
    payloads: Arc<PayloadStore>,
    schemas: Arc<SchemaCache>,
    pubsub: Arc<dyn PubSubApi>,
    registry: SubscriptionRegistry,
    pending: PendingRequests,
    outbound: Outbound,
    relay: Arc<Relay>,
    aux: OnceCell<AuxServerHandle>,
    shutdown: CancellationToken,
}

impl Session {
    /// Build a session with the real backends
    ///
    /// Returns the receiver the transport writer drains. Must be called
    /// inside a tokio runtime.
    pub fn new(config: GatewayConfig) -> Result<(Arc<Self>, mpsc::Receiver<Bytes>)> {
        let backends = Backends::from_config(&config);
        Self::with_backends(config, backends)
    }

    pub fn with_backends(
        config: GatewayConfig,
        backends: Backends,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Bytes>)> {
        config.validate()?;
        let threshold = config.payloads.threshold_bytes;
        let queue_depth = config.platform.event_queue_depth;

        let payloads = Arc::new(PayloadStore::new(config.payloads.ttl()));
        let schemas = Arc::new(SchemaCache::new());
        let (outbound, frames) = Outbound::channel(
            config.transport.outbound_queue_depth,
            Arc::clone(&payloads),
            threshold,
        );

        let pubsub_backend = Arc::new(PubSubBackend::new(
            Arc::clone(&backends.pubsub),
            Arc::clone(&schemas),
            config.platform.fetch_batch_size,
            queue_depth,
        ));
        let cometd = Arc::new(CometdBackend::new(
            Arc::new(CometdPool::new(backends.bayeux)),
            queue_depth,
        ));
        let registry = SubscriptionRegistry::new(pubsub_backend, cometd, outbound.clone());
        let relay = Arc::new(Relay::new(
            config.platform.clone(),
            Arc::clone(&payloads),
            threshold,
        )?);

        let shutdown = CancellationToken::new();
        payloads.spawn_sweeper(config.payloads.sweep_interval(), shutdown.child_token());

        let session = Arc::new(Self {
            config,
            payloads,
            schemas,
            pubsub: backends.pubsub,
            registry,
            pending: PendingRequests::new(),
            outbound,
            relay,
            aux: OnceCell::new(),
            shutdown,
        });
        Ok((session, frames))
    }

    /// Start the auxiliary server on first call; later calls return the
    /// same port and secret
    pub async fn init(&self) -> Result<InitResult> {
        let handle = self
            .aux
            .get_or_try_init(|| {
                aux_server::start(
                    &self.config.aux_server,
                    Arc::clone(&self.payloads),
                    Arc::clone(&self.relay),
                    self.shutdown.child_token(),
                )
            })
            .await?;
        Ok(InitResult {
            version: GATEWAY_VERSION.to_string(),
            http_port: handle.port,
            secret: handle.secret.clone(),
        })
    }

    pub fn ping(&self) -> PingResult {
        PingResult {
            version: GATEWAY_VERSION.to_string(),
        }
    }

    /// Tear everything down after the transport is gone
    pub fn shutdown(&self) {
        let subscriptions = self.registry.cancel_all();
        let pending = self
            .pending
            .reject_all(GatewayError::transport("transport closed"));
        self.shutdown.cancel();
        info!(subscriptions, pending, "Session shut down");
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn schemas(&self) -> &Arc<SchemaCache> {
        &self.schemas
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSubApi> {
        &self.pubsub
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn aux_server(&self) -> Option<&AuxServerHandle> {
        self.aux.get()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
