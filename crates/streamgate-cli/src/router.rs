//! Request dispatch
//!
//! Every inbound frame is decoded and routed through one exhaustive match on
//! [`Request`]. `subscribe` and `unsubscribe` answer immediately; everything
//! else is tracked in the pending table and answered when its handler
//! finishes or its deadline passes, whichever comes first. Handlers run on
//! their own tasks so a slow upstream never stalls the transport reader.

use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use streamgate_core::error::excerpt;
use streamgate_core::protocol::{RequestFrame, UnsubscribeResult};
use streamgate_core::{select_protocol, Credential, GatewayError, Protocol, Request, Result};
use tracing::{debug, warn};

use crate::pubsub::{fetch_schema, topic_json};
use crate::session::Session;

pub struct Router {
    session: Arc<Session>,
}

impl Router {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Handle one inbound frame body
    ///
    /// Only fails when the outbound side is gone, which ends the session.
    pub async fn dispatch(&self, body: Bytes) -> Result<()> {
        let outbound = self.session.outbound();
        let RequestFrame { id, request } = match RequestFrame::parse(&body) {
            Ok(frame) => frame,
            Err(rejected) => {
                warn!(request_id = ?rejected.id, error = %rejected.error, "Rejected inbound frame");
                return outbound.respond(rejected.id, Err(rejected.error)).await;
            }
        };

        let kind = request.kind();
        debug!(request_id = ?id, request_type = %kind, "Dispatching request");

        if !kind.is_correlated() {
            let result = handle(&self.session, request).await;
            return outbound.respond(Some(id), result).await;
        }

        let timeout = self.session.config().requests.timeout();
        let reply = match self.session.pending().register(&id, timeout) {
            Ok(reply) => reply,
            Err(error) => return outbound.respond(Some(id), Err(error)).await,
        };

        let reply_id = reply.id().clone();
        let session = Arc::clone(&self.session);
        let handler = tokio::spawn(async move {
            let result = handle(&session, request).await;
            session.pending().resolve(&reply_id, result);
        });

        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let result = reply.wait(session.pending()).await;
            if let Err(GatewayError::Timeout(ms)) = &result {
                warn!(request_id = ?id, request_type = %kind, timeout_ms = ms, "Request timed out");
                handler.abort();
            }
            if let Err(error) = session.outbound().respond(Some(id), result).await {
                debug!(%error, "Dropping response after transport closed");
            }
        });

        Ok(())
    }
}

async fn handle(session: &Session, request: Request) -> Result<Value> {
    match request {
        Request::Init => Ok(serde_json::to_value(session.init().await?)?),
        Request::Ping => Ok(serde_json::to_value(session.ping())?),
        Request::Rest(params) => session.relay().execute(&params).await,
        Request::TokenExchange(params) => session.relay().exchange_token(&params).await,
        Request::Subscribe(params) => {
            let credential = Credential::from_params(params.credential)?;
            let created = session
                .registry()
                .create(&params.channel, credential, params.replay)?;
            Ok(serde_json::to_value(created)?)
        }
        Request::Unsubscribe(params) => {
            let cancelled = session.registry().cancel(&params.subscription_id);
            Ok(serde_json::to_value(UnsubscribeResult {
                subscription_id: params.subscription_id,
                cancelled,
            })?)
        }
        Request::GetSchema(params) => {
            let credential = Credential::from_params(params.credential)?;
            if params.schema_id.trim().is_empty() {
                return Err(GatewayError::validation("schemaId must not be empty"));
            }
            let schema = fetch_schema(
                session.pubsub(),
                session.schemas(),
                &credential,
                &params.schema_id,
            )
            .await?;
            Ok(json!({
                "schemaId": schema.schema_id,
                "schemaJson": schema.schema_json,
                "fetchedAt": schema.fetched_at.to_rfc3339(),
            }))
        }
        Request::GetTopic(params) => {
            let credential = Credential::from_params(params.credential)?;
            let route = select_protocol(&params.topic_name)?;
            if route.protocol != Protocol::PubSub {
                return Err(GatewayError::protocol(format!(
                    "getTopic only applies to /event channels, not {}",
                    excerpt(&route.name)
                )));
            }
            let topic = session.pubsub().get_topic(&credential, &route.name).await?;
            Ok(topic_json(&topic))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::proto::FetchResponse;
    use crate::pubsub::tests::{consumer_event, FakePubSub, INSTANCE, TOKEN};
    use crate::session::tests::fake_session;
    use axum::routing::get;
    use std::time::Duration;
    use streamgate_core::{GatewayConfig, RequestId};
    use tokio::sync::mpsc;

    async fn next_frame(frames: &mut mpsc::Receiver<Bytes>) -> Value {
        let body = tokio::time::timeout(Duration::from_secs(10), frames.recv())
            .await
            .expect("no frame within deadline")
            .expect("outbound closed");
        serde_json::from_slice(&body).unwrap()
    }

    fn frame(value: Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    async fn upstream() -> String {
        let app = axum::Router::new()
            .route("/report", get(|| async { "r".repeat(2_000_000) }))
            .route("/small", get(|| async { "ok" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config() -> GatewayConfig {
        GatewayConfig::new().allow_relay_host("127.0.0.1")
    }

    #[tokio::test]
    async fn test_large_rest_result_goes_through_aux_server() {
        let base = upstream().await;
        let (session, mut frames) = fake_session(config(), FakePubSub::default());
        let router = Router::new(session.clone());

        router.dispatch(frame(json!({"id": 1, "type": "init"}))).await.unwrap();
        let init = next_frame(&mut frames).await;
        let port = init["result"]["httpPort"].as_u64().unwrap();
        let secret = init["result"]["secret"].as_str().unwrap().to_string();

        router
            .dispatch(frame(json!({"id": "big", "type": "rest", "url": format!("{base}/report")})))
            .await
            .unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["id"], json!("big"));
        assert_eq!(response["result"]["status"], json!(200));
        assert_eq!(response["result"]["size"], json!(2_000_000));
        assert!(response["result"].get("body").is_none());
        let payload_id = response["result"]["largePayloadId"].as_str().unwrap();

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{port}/payload/{payload_id}");
        let first = client.get(&url).header("X-Proxy-Secret", &secret).send().await.unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(first.bytes().await.unwrap().len(), 2_000_000);
        let second = client.get(&url).header("X-Proxy-Secret", &secret).send().await.unwrap();
        assert_eq!(second.status(), 404);

        session.shutdown();
    }

    #[tokio::test]
    async fn test_small_rest_result_is_inline() {
        let base = upstream().await;
        let (session, mut frames) = fake_session(config(), FakePubSub::default());
        let router = Router::new(session);

        router
            .dispatch(frame(json!({"id": 7, "type": "rest", "url": format!("{base}/small")})))
            .await
            .unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["id"], json!(7));
        assert_eq!(response["result"]["body"], json!("ok"));
    }

    #[tokio::test]
    async fn test_slow_request_times_out_and_is_removed() {
        let base = upstream().await;
        let config = config().with_request_timeout(Duration::from_millis(200));
        let (session, mut frames) = fake_session(config, FakePubSub::default());
        let router = Router::new(session.clone());

        router
            .dispatch(frame(json!({"id": "slow-1", "type": "rest", "url": format!("{base}/slow")})))
            .await
            .unwrap();
        assert!(session.pending().contains(&RequestId::from("slow-1")));

        let response = next_frame(&mut frames).await;
        assert_eq!(response["id"], json!("slow-1"));
        assert_eq!(response["code"], json!("TIMEOUT"));
        assert!(session.pending().is_empty());

        // The same id may be reused once the first attempt is gone
        router
            .dispatch(frame(json!({"id": "slow-1", "type": "ping"})))
            .await
            .unwrap();
        assert!(next_frame(&mut frames).await.get("result").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_is_rejected() {
        let base = upstream().await;
        let config = config().with_request_timeout(Duration::from_millis(300));
        let (session, mut frames) = fake_session(config, FakePubSub::default());
        let router = Router::new(session);

        let slow = json!({"id": "dup", "type": "rest", "url": format!("{base}/slow")});
        router.dispatch(frame(slow.clone())).await.unwrap();
        router.dispatch(frame(slow)).await.unwrap();

        let first = next_frame(&mut frames).await;
        assert_eq!(first["code"], json!("VALIDATION_ERROR"));
        let second = next_frame(&mut frames).await;
        assert_eq!(second["code"], json!("TIMEOUT"));
    }

    #[tokio::test]
    async fn test_unknown_type_and_garbage() {
        let (session, mut frames) = fake_session(config(), FakePubSub::default());
        let router = Router::new(session);

        router
            .dispatch(frame(json!({"id": "x1", "type": "frobnicate"})))
            .await
            .unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["id"], json!("x1"));
        assert_eq!(response["code"], json!("PROTOCOL_ERROR"));

        router.dispatch(Bytes::from_static(b"{not json")).await.unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["id"], Value::Null);
        assert_eq!(response["code"], json!("VALIDATION_ERROR"));

        router.dispatch(frame(json!({"id": 2, "type": "ping"}))).await.unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["result"]["version"], json!(streamgate_core::GATEWAY_VERSION));
    }

    #[tokio::test]
    async fn test_subscribe_streams_events_until_unsubscribe() {
        let mut api = FakePubSub::with_script(vec![Ok(FetchResponse {
            events: vec![consumer_event("S1", 5, "A-5")],
            pending_num_requested: 99,
            ..Default::default()
        })]);
        api.hold_open = true;
        let (session, mut frames) = fake_session(config(), api);
        let router = Router::new(session.clone());

        router
            .dispatch(frame(json!({
                "id": "s1",
                "type": "subscribe",
                "channel": "Order_Event__e",
                "accessToken": TOKEN,
                "instanceUrl": INSTANCE,
                "replay": "earliest"
            })))
            .await
            .unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["result"]["channel"], json!("/event/Order_Event__e"));
        assert_eq!(response["result"]["protocol"], json!("pubsub"));
        let subscription_id = response["result"]["subscriptionId"].as_str().unwrap().to_string();

        let event = next_frame(&mut frames).await;
        assert_eq!(event["type"], json!("streamEvent"));
        assert_eq!(event["subscriptionId"], json!(subscription_id));
        assert_eq!(event["event"]["payload"]["OrderNumber__c"], json!("A-5"));
        assert_eq!(event["event"]["replayId"], json!(5));

        router
            .dispatch(frame(json!({"id": "u1", "type": "unsubscribe", "subscriptionId": subscription_id})))
            .await
            .unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["result"]["cancelled"], json!(true));
        assert!(session.registry().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejections() {
        let (session, mut frames) = fake_session(config(), FakePubSub::default());
        let router = Router::new(session.clone());

        router
            .dispatch(frame(json!({
                "id": 1,
                "type": "subscribe",
                "channel": "/bogus/Thing",
                "accessToken": TOKEN,
                "instanceUrl": INSTANCE
            })))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut frames).await["code"], json!("PROTOCOL_ERROR"));

        router
            .dispatch(frame(json!({
                "id": 2,
                "type": "subscribe",
                "channel": "AccountUpdates",
                "accessToken": "not-a-session",
                "instanceUrl": INSTANCE
            })))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut frames).await["code"], json!("VALIDATION_ERROR"));
        assert!(session.registry().is_empty());

        router
            .dispatch(frame(json!({"id": 3, "type": "unsubscribe", "subscriptionId": "nope"})))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut frames).await["result"]["cancelled"], json!(false));
    }

    #[tokio::test]
    async fn test_schema_and_topic_metadata() {
        let (session, mut frames) = fake_session(config(), FakePubSub::default());
        let router = Router::new(session.clone());

        router
            .dispatch(frame(json!({
                "id": "g1",
                "type": "getSchema",
                "schemaId": "S1",
                "accessToken": TOKEN,
                "instanceUrl": INSTANCE
            })))
            .await
            .unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["result"]["schemaId"], json!("S1"));
        assert!(response["result"]["schemaJson"]
            .as_str()
            .unwrap()
            .contains("Order_Event__e"));
        assert_eq!(session.schemas().len(), 1);

        router
            .dispatch(frame(json!({
                "id": "t1",
                "type": "getTopic",
                "topicName": "Order_Event__e",
                "accessToken": TOKEN,
                "instanceUrl": INSTANCE
            })))
            .await
            .unwrap();
        let response = next_frame(&mut frames).await;
        assert_eq!(response["result"]["topicName"], json!("/event/Order_Event__e"));
        assert_eq!(response["result"]["schemaId"], json!("S1"));

        router
            .dispatch(frame(json!({
                "id": "t2",
                "type": "getTopic",
                "topicName": "/topic/AccountUpdates",
                "accessToken": TOKEN,
                "instanceUrl": INSTANCE
            })))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut frames).await["code"], json!("PROTOCOL_ERROR"));
    }
}
