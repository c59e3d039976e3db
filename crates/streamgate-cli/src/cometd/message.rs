//! Bayeux message types

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use streamgate_core::{Protocol, StreamEvent};

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
pub const META_DISCONNECT: &str = "/meta/disconnect";

const BAYEUX_VERSION: &str = "1.0";
const LONG_POLLING: &str = "long-polling";

/// What the server wants the client to do after a reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    Handshake,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Milliseconds to wait before the next connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server may hold a connect open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// One message in a Bayeux batch, request or reply
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BayeuxMessage {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
}

impl BayeuxMessage {
    pub fn handshake() -> Self {
        Self {
            channel: META_HANDSHAKE.to_string(),
            version: Some(BAYEUX_VERSION.to_string()),
            minimum_version: Some(BAYEUX_VERSION.to_string()),
            supported_connection_types: Some(vec![LONG_POLLING.to_string()]),
            ..Self::default()
        }
    }

    pub fn connect(client_id: &str) -> Self {
        Self {
            channel: META_CONNECT.to_string(),
            client_id: Some(client_id.to_string()),
            connection_type: Some(LONG_POLLING.to_string()),
            ..Self::default()
        }
    }

    /// Subscribe with a replay position in the `ext.replay` map
    pub fn subscribe(client_id: &str, channel: &str, replay: i64) -> Self {
        Self {
            channel: META_SUBSCRIBE.to_string(),
            client_id: Some(client_id.to_string()),
            subscription: Some(channel.to_string()),
            ext: Some(json!({ "replay": { channel: replay } })),
            ..Self::default()
        }
    }

    pub fn unsubscribe(client_id: &str, channel: &str) -> Self {
        Self {
            channel: META_UNSUBSCRIBE.to_string(),
            client_id: Some(client_id.to_string()),
            subscription: Some(channel.to_string()),
            ..Self::default()
        }
    }

    pub fn disconnect(client_id: &str) -> Self {
        Self {
            channel: META_DISCONNECT.to_string(),
            client_id: Some(client_id.to_string()),
            ..Self::default()
        }
    }

    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    pub fn is_successful(&self) -> bool {
        self.successful.unwrap_or(false)
    }

    /// Server error text, or a generic one naming the channel
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("{} was not successful", self.channel))
    }

    /// Replay id carried in a data message's `data.event.replayId`
    pub fn replay_id(&self) -> Option<i64> {
        self.data.as_ref()?.get("event")?.get("replayId")?.as_i64()
    }

    /// Convert a data message into the protocol-neutral event shape
    ///
    /// Change events and platform events carry their body in `payload`;
    /// PushTopic events carry it in `sobject`.
    pub fn into_stream_event(self) -> StreamEvent {
        let replay_id = self.replay_id().map(Value::from).unwrap_or(Value::Null);
        let data = self.data.unwrap_or(Value::Null);
        let event_id = data
            .get("event")
            .and_then(|event| event.get("EventUuid").or_else(|| event.get("uuid")))
            .and_then(Value::as_str)
            .map(str::to_string);
        let payload = match data.get("payload").or_else(|| data.get("sobject")) {
            Some(body) => body.clone(),
            None => data,
        };

        StreamEvent {
            channel: self.channel,
            protocol: Protocol::CometD,
            replay_id,
            payload,
            schema_id: None,
            event_id,
        }
    }
}
