//! Auxiliary loopback HTTP server
//!
//! Serves what does not fit through the narrow transport: one-time payload
//! retrieval and streamed relay calls. Every route requires the shared
//! secret in `X-Proxy-Secret`. CORS preflight is answered before the secret
//! check so a browser client can attach the header.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use streamgate_core::config::AuxServerConfig;
use streamgate_core::protocol::RestParams;
use streamgate_core::security::{generate_shared_secret, secrets_match, SECRET_HEADER};
use streamgate_core::{GatewayError, PayloadStore, Result};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::relay::{is_hop_by_hop, Relay};

/// Port and secret handed back to the client by `init`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxServerHandle {
    pub port: u16,
    pub secret: String,
}

#[derive(Clone)]
struct AuxState {
    secret: Arc<str>,
    payloads: Arc<PayloadStore>,
    relay: Arc<Relay>,
}

/// Build the route table
fn router(state: AuxState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/payload/:id", get(payload_handler))
        .route("/relay", post(relay_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
        .layer(cors)
}

/// Bind the loopback listener and serve until `shutdown` fires
pub async fn start(
    config: &AuxServerConfig,
    payloads: Arc<PayloadStore>,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
) -> Result<AuxServerHandle> {
    let secret = generate_shared_secret()?;
    let state = AuxState {
        secret: Arc::from(secret.as_str()),
        payloads,
        relay,
    };

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::transport(format!("Failed to bind auxiliary server on {addr}: {e}")))?;
    let port = listener.local_addr()?.port();
    info!(port, "Auxiliary server listening on 127.0.0.1");

    let app = router(state);
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        match served {
            Ok(()) => info!("Auxiliary server stopped"),
            Err(e) => error!("Auxiliary server error: {e}"),
        }
    });

    Ok(AuxServerHandle { port, secret })
}

async fn require_secret(State(state): State<AuxState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| secrets_match(&state.secret, presented));
    if !authorized {
        warn!(path = %request.uri().path(), "Rejected auxiliary request without a valid secret");
        return (StatusCode::UNAUTHORIZED, "missing or invalid proxy secret").into_response();
    }
    next.run(request).await
}

async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// One-time payload retrieval
async fn payload_handler(State(state): State<AuxState>, Path(id): Path<String>) -> Response {
    match state.payloads.take(&id) {
        Ok(payload) => {
            debug!(payload_id = %id, size = payload.bytes.len(), "Payload retrieved");
            let content_type = payload
                .content_type
                .and_then(|ct| HeaderValue::from_str(&ct).ok())
                .unwrap_or(HeaderValue::from_static("application/octet-stream"));
            ([(header::CONTENT_TYPE, content_type)], payload.bytes).into_response()
        }
        Err(e) => {
            debug!(payload_id = %id, "Payload lookup failed: {e}");
            (StatusCode::NOT_FOUND, "payload not found").into_response()
        }
    }
}

/// Target of a raw-body relay call, given in the query string
#[derive(Debug, Deserialize)]
struct RawTarget {
    url: Option<String>,
    method: Option<String>,
}

/// Relay a call and stream the upstream response back unbuffered
///
/// With `?url=` the request body is streamed to the target as-is and the
/// request headers are forwarded; otherwise the body is a JSON document
/// shaped like the `rest` request.
async fn relay_handler(
    State(state): State<AuxState>,
    Query(target): Query<RawTarget>,
    request: Request,
) -> Response {
    let (params, raw_body) = match target.url {
        Some(url) => {
            let headers = request
                .headers()
                .iter()
                .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && !is_browser_only(name.as_str()))
                .filter_map(|(name, value)| {
                    let value = value.to_str().ok()?;
                    Some((name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let params = RestParams {
                url,
                method: target.method.unwrap_or_else(|| "POST".to_string()),
                headers,
                body: None,
                body_base64: None,
            };
            (params, Some(request.into_body()))
        }
        None => match Json::<RestParams>::from_request(request, &state).await {
            Ok(Json(params)) => (params, None),
            Err(rejection) => return rejection.into_response(),
        },
    };

    let mut request = match state.relay.prepare(&params) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    if let Some(body) = raw_body {
        debug!(url = %params.url, "Streaming raw request body upstream");
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            error!(url = %params.url, "Relay request failed: {e}");
            return (StatusCode::BAD_GATEWAY, format!("Relay request failed: {e}")).into_response();
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        response = response.header(name.as_str(), value.as_bytes());
    }

    let body = Body::from_stream(upstream.bytes_stream().map_err(std::io::Error::other));
    response
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Headers a browser attaches to the call into this server that mean
/// nothing to the relay target
fn is_browser_only(name: &str) -> bool {
    ["origin", "referer", "cookie"]
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
        || name.to_ascii_lowercase().starts_with("sec-")
        || name.to_ascii_lowercase().starts_with("access-control-")
}
