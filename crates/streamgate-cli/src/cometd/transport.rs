//! HTTP transport for the Bayeux long-poll bus

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use streamgate_core::error::excerpt;
use streamgate_core::{Credential, GatewayError, Result};
use tracing::debug;

use super::message::BayeuxMessage;

/// Upper bound on one round trip; the server holds a connect for up to 110 s
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(140);

/// Sends a batch of Bayeux messages and returns the reply batch
#[async_trait]
pub trait BayeuxTransport: Send + Sync {
    async fn exchange(&self, messages: Vec<BayeuxMessage>) -> Result<Vec<BayeuxMessage>>;
}

/// Creates one transport per pooled client
pub trait TransportFactory: Send + Sync {
    fn create(&self, credential: &Credential) -> Result<Arc<dyn BayeuxTransport>>;
}

/// Bayeux over HTTP POST with a private cookie jar
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl HttpTransport {
    pub fn new(credential: &Credential, api_version: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(LONG_POLL_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::upstream(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/cometd/{}", credential.instance_url(), api_version),
            access_token: credential.access_token().to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BayeuxTransport for HttpTransport {
    async fn exchange(&self, messages: Vec<BayeuxMessage>) -> Result<Vec<BayeuxMessage>> {
        let channels: Vec<&str> = messages.iter().map(|m| m.channel.as_str()).collect();
        debug!(endpoint = %self.endpoint, ?channels, "Bayeux request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&messages)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Bayeux request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::upstream(format!(
                "Bayeux authentication failed ({status})"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::upstream(format!(
                "Bayeux endpoint returned {status}: {}",
                excerpt(&body)
            )));
        }

        response
            .json::<Vec<BayeuxMessage>>()
            .await
            .map_err(|e| GatewayError::upstream(format!("Malformed Bayeux reply: {e}")))
    }
}

/// Factory for [`HttpTransport`]s against `<instance>/cometd/<version>`
pub struct HttpTransportFactory {
    api_version: String,
}

impl HttpTransportFactory {
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, credential: &Credential) -> Result<Arc<dyn BayeuxTransport>> {
        Ok(Arc::new(HttpTransport::new(credential, &self.api_version)?))
    }
}
