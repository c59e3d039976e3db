//! Plain REST relay and OAuth token exchange
//!
//! Both operations forward a single HTTP call on behalf of the client. Targets
//! must be http(s) URLs whose host is on the configured allow-list, so the
//! relay cannot be used as a general-purpose proxy.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use streamgate_core::config::PlatformConfig;
use streamgate_core::error::{excerpt, excerpt_to};
use streamgate_core::outbound::large_payload_ref;
use streamgate_core::protocol::{RestParams, TokenExchangeParams};
use streamgate_core::security::SECRET_HEADER;
use streamgate_core::{GatewayError, PayloadStore, Result};
use tracing::{debug, info, warn};
use url::Url;

/// Headers that describe one connection and never cross the relay
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const OCTET_STREAM: &str = "application/octet-stream";

/// Longest token endpoint error body carried back in an error response
const MAX_TOKEN_ERROR_CHARS: usize = 4096;

/// Whether a header should be dropped when forwarding in either direction
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) || name.eq_ignore_ascii_case(SECRET_HEADER)
}

/// Executes relayed calls for the `rest`/`tokenExchange` requests and the
/// auxiliary server's `/relay` route
pub struct Relay {
    client: Client,
    platform: PlatformConfig,
    payloads: Arc<PayloadStore>,
    threshold: usize,
}

impl Relay {
    pub fn new(platform: PlatformConfig, payloads: Arc<PayloadStore>, threshold: usize) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::upstream(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            platform,
            payloads,
            threshold,
        })
    }

    /// Parse a target URL and check it against the allow-list
    pub fn check_target(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|e| GatewayError::validation(format!("invalid relay url '{}': {e}", excerpt(raw))))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::validation(format!(
                "relay url must be http or https, got '{}'",
                excerpt(url.scheme())
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::validation("relay url has no host"))?;
        if !self.platform.allows_host(host) {
            return Err(GatewayError::validation(format!(
                "relay target host '{}' is not allowed",
                excerpt(host)
            )));
        }
        Ok(url)
    }

    /// Build the upstream request for a set of relay parameters
    pub fn prepare(&self, params: &RestParams) -> Result<reqwest::RequestBuilder> {
        let url = self.check_target(&params.url)?;
        let method = Method::from_bytes(params.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| GatewayError::validation(format!("invalid HTTP method '{}'", excerpt(&params.method))))?;

        let mut request = self.client.request(method, url);
        for (name, value) in &params.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        match (&params.body, &params.body_base64) {
            (Some(_), Some(_)) => {
                return Err(GatewayError::validation("body and bodyBase64 are mutually exclusive"))
            }
            (Some(body), None) => request = request.body(body.clone()),
            (None, Some(encoded)) => {
                let bytes = BASE64
                    .decode(encoded)
                    .map_err(|e| GatewayError::validation(format!("invalid bodyBase64: {e}")))?;
                request = request.body(bytes);
            }
            (None, None) => {}
        }
        Ok(request)
    }

    /// Perform a relayed call and render the reply for a response frame
    ///
    /// Bodies over the overflow threshold are parked in the payload store
    /// and referenced by `largePayloadId`.
    pub async fn execute(&self, params: &RestParams) -> Result<Value> {
        let request = self.prepare(params)?;
        debug!(method = %params.method, url = %params.url, "Relaying request");

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Relay request failed: {e}")))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream(format!("Failed to read relay response: {e}")))?;

        let mut result = Map::new();
        result.insert("status".into(), json!(status.as_u16()));
        result.insert("headers".into(), json!(header_map(&headers)));

        if body.len() > self.threshold {
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(OCTET_STREAM)
                .to_string();
            let size = body.len();
            let id = self.payloads.put_typed(body, content_type);
            info!(url = %params.url, payload_id = %id, size, "Relay body stored for retrieval");
            if let Value::Object(reference) = large_payload_ref((id, size)) {
                result.extend(reference);
            }
        } else {
            let (key, value) = render_body(body);
            result.insert(key.into(), value);
        }

        Ok(Value::Object(result))
    }

    /// Exchange an authorization code at the token endpoint
    ///
    /// The token endpoint's JSON reply is returned unchanged.
    pub async fn exchange_token(&self, params: &TokenExchangeParams) -> Result<Value> {
        let endpoint = self.check_target(&params.endpoint()?)?;
        let form = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.form())
            .finish();
        info!(endpoint = %endpoint, client_id = %params.client_id, "Exchanging authorization code");

        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(form)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Token request failed: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream(format!("Failed to read token response: {e}")))?;
        let reply: Option<Value> = serde_json::from_slice(&body).ok();

        if !status.is_success() {
            // The reply is passed on as-is so OAuth `error` fields reach the caller
            let raw = match &reply {
                Some(json) => json.to_string(),
                None => String::from_utf8_lossy(&body).into_owned(),
            };
            let oauth_error = reply.as_ref().and_then(|r| r.get("error")).and_then(Value::as_str);
            warn!(%status, ?oauth_error, "Token exchange rejected");
            return Err(GatewayError::upstream(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                excerpt_to(&raw, MAX_TOKEN_ERROR_CHARS)
            )));
        }

        reply.ok_or_else(|| GatewayError::upstream("token endpoint reply is not JSON"))
    }
}

/// Flatten response headers, joining repeated names with ", "
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// Text bodies go out as `body`, anything else as `bodyBase64`
fn render_body(body: Bytes) -> (&'static str, Value) {
    match String::from_utf8(body.to_vec()) {
        Ok(text) => ("body", Value::String(text)),
        Err(_) => ("bodyBase64", Value::String(BASE64.encode(&body))),
    }
}
