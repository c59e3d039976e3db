//! gRPC client for the Pub/Sub API
//!
//! One HTTP/2 channel is created lazily on first use and shared by every
//! call. Each `subscribe` opens its own bidirectional stream on that channel.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use http::uri::PathAndQuery;
use streamgate_core::error::excerpt;
use streamgate_core::{Credential, GatewayError, Result};
use tokio::sync::{mpsc, OnceCell};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use super::proto::{FetchRequest, FetchResponse, SchemaInfo, SchemaRequest, TopicInfo, TopicRequest};

const GET_TOPIC_PATH: &str = "/eventbus.v1.PubSub/GetTopic";
const GET_SCHEMA_PATH: &str = "/eventbus.v1.PubSub/GetSchema";
const SUBSCRIBE_PATH: &str = "/eventbus.v1.PubSub/Subscribe";

/// Stream of fetch responses for one subscription
pub type FetchStream = BoxStream<'static, Result<FetchResponse>>;

/// The Pub/Sub RPCs the gateway uses
#[async_trait]
pub trait PubSubApi: Send + Sync {
    async fn get_topic(&self, credential: &Credential, topic_name: &str) -> Result<TopicInfo>;

    async fn get_schema(&self, credential: &Credential, schema_id: &str) -> Result<SchemaInfo>;

    /// Open a Subscribe stream; every FetchRequest sent on `requests` goes
    /// to the server, and dropping the sender half-closes the stream
    async fn subscribe(
        &self,
        credential: &Credential,
        requests: mpsc::Receiver<FetchRequest>,
    ) -> Result<FetchStream>;
}

/// tonic-backed [`PubSubApi`]
pub struct GrpcPubSub {
    endpoint: String,
    channel: OnceCell<Channel>,
}

impl GrpcPubSub {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            channel: OnceCell::new(),
        }
    }

    async fn channel(&self) -> Result<Channel> {
        let channel = self
            .channel
            .get_or_try_init(|| async {
                let mut endpoint = Endpoint::from_shared(self.endpoint.clone()).map_err(|e| {
                    GatewayError::validation(format!("invalid Pub/Sub endpoint '{}': {e}", self.endpoint))
                })?;
                if self.endpoint.starts_with("https://") {
                    endpoint = endpoint
                        .tls_config(ClientTlsConfig::new().with_native_roots())
                        .map_err(|e| GatewayError::upstream(format!("TLS setup failed: {e}")))?;
                }
                info!(endpoint = %self.endpoint, "Opening Pub/Sub channel");
                Ok::<_, GatewayError>(endpoint.connect_lazy())
            })
            .await?;
        Ok(channel.clone())
    }

    async fn grpc(&self) -> Result<tonic::client::Grpc<Channel>> {
        let mut grpc = tonic::client::Grpc::new(self.channel().await?);
        grpc.ready()
            .await
            .map_err(|e| GatewayError::upstream(format!("Pub/Sub service not ready: {e}")))?;
        Ok(grpc)
    }
}

/// Attach the auth headers the Pub/Sub API expects
fn authorize<T>(message: T, credential: &Credential) -> Result<tonic::Request<T>> {
    let mut request = tonic::Request::new(message);
    let metadata = request.metadata_mut();
    metadata.insert("accesstoken", ascii(credential.access_token())?);
    metadata.insert("instanceurl", ascii(credential.instance_url())?);
    metadata.insert("tenantid", ascii(credential.org_id())?);
    Ok(request)
}

fn ascii(value: &str) -> Result<MetadataValue<Ascii>> {
    value
        .parse()
        .map_err(|_| GatewayError::validation("credential contains characters not allowed in a header"))
}

fn status_error(status: tonic::Status) -> GatewayError {
    GatewayError::upstream(format!(
        "Pub/Sub {:?}: {}",
        status.code(),
        excerpt(status.message())
    ))
}

#[async_trait]
impl PubSubApi for GrpcPubSub {
    async fn get_topic(&self, credential: &Credential, topic_name: &str) -> Result<TopicInfo> {
        let request = authorize(
            TopicRequest {
                topic_name: topic_name.to_string(),
            },
            credential,
        )?;
        let mut grpc = self.grpc().await?;
        let response: tonic::Response<TopicInfo> = grpc
            .unary(request, PathAndQuery::from_static(GET_TOPIC_PATH), ProstCodec::default())
            .await
            .map_err(status_error)?;
        Ok(response.into_inner())
    }

    async fn get_schema(&self, credential: &Credential, schema_id: &str) -> Result<SchemaInfo> {
        let request = authorize(
            SchemaRequest {
                schema_id: schema_id.to_string(),
            },
            credential,
        )?;
        let mut grpc = self.grpc().await?;
        debug!(schema_id, "GetSchema");
        let response: tonic::Response<SchemaInfo> = grpc
            .unary(request, PathAndQuery::from_static(GET_SCHEMA_PATH), ProstCodec::default())
            .await
            .map_err(status_error)?;
        Ok(response.into_inner())
    }

    async fn subscribe(
        &self,
        credential: &Credential,
        requests: mpsc::Receiver<FetchRequest>,
    ) -> Result<FetchStream> {
        let request = authorize(ReceiverStream::new(requests), credential)?;
        let mut grpc = self.grpc().await?;
        let response: tonic::Response<tonic::Streaming<FetchResponse>> = grpc
            .streaming(request, PathAndQuery::from_static(SUBSCRIBE_PATH), ProstCodec::default())
            .await
            .map_err(status_error)?;
        Ok(response.into_inner().map(|item| item.map_err(status_error)).boxed())
    }
}
