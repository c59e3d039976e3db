//! Streamgate Core Library
//!
//! Core types for the streamgate local gateway. This crate holds everything
//! that does not talk to the network: the frame codec for the narrow
//! transport, request and response types, channel routing, the subscription
//! registry, the payload overflow store and the schema cache.
//!
//! # Modules
//!
//! - [`framing`] - Length-prefixed frame codec
//! - [`protocol`] - Request, response and push frame types
//! - [`channel`] - Channel name → backend protocol routing
//! - [`credential`] - Per-request credentials and organization ids
//! - [`replay`] - Replay markers
//! - [`stream`] - Protocol-neutral stream events
//! - [`registry`] - Subscription registry and the backend trait
//! - [`pending`] - In-flight request correlation and timeouts
//! - [`outbound`] - Outbound frame emission with payload overflow
//! - [`payload_store`] - One-time-read TTL blob store
//! - [`schema_cache`] - Event schema cache and Avro decoding
//! - [`security`] - Shared-secret generation and comparison
//! - [`config`] - Configuration
//! - [`error`] - Error types

pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod framing;
pub mod outbound;
pub mod payload_store;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod replay;
pub mod schema_cache;
pub mod security;
pub mod stream;

/// Version reported by `init` and `ping`
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use channel::{select_protocol, ChannelRoute, Namespace, Protocol};
pub use config::GatewayConfig;
pub use credential::{Credential, CredentialParams, PoolKey};
pub use error::{GatewayError, Result};
pub use framing::{FrameCodec, FrameError, FrameReader, FrameWriter};
pub use outbound::Outbound;
pub use payload_store::{Payload, PayloadStore};
pub use pending::{PendingReply, PendingRequests};
pub use protocol::{PushFrame, Request, RequestFrame, RequestId, RequestType, ResponseFrame};
pub use registry::{BackendRequest, StreamBackend, SubscriptionRegistry};
pub use replay::ReplayMarker;
pub use schema_cache::{CachedSchema, SchemaCache};
pub use stream::{StreamEvent, StreamItem};
