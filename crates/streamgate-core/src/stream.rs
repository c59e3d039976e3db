//! Protocol-neutral stream events
//!
//! Both backends deliver the same event shape so the registry and router
//! never need to know which protocol produced it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Protocol;
use crate::error::GatewayError;

/// One decoded event from a subscribed channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub channel: String,
    pub protocol: Protocol,
    /// Position of this event; feed it back as a replay marker to resume
    pub replay_id: Value,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// What a backend hands to the registry for one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(StreamEvent),
    /// Terminal failure; nothing follows
    Failed(GatewayError),
    /// Terminal clean close initiated by the platform
    Ended(Option<String>),
}

impl StreamItem {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamItem::Event(_))
    }
}
