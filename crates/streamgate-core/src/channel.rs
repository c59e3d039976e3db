//! Channel name routing
//!
//! Decides which backend protocol serves a channel, purely from its name.
//! Absolute names carry their namespace (`/event/Order_Event__e`); bare names
//! are classified by their suffix and normalized to an absolute name.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{excerpt, GatewayError, Result};

/// Backend protocol serving a channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Binary bidirectional-streaming pub/sub (gRPC, schema-encoded events)
    PubSub,
    /// Legacy long-poll publish/subscribe bus (Bayeux)
    CometD,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::PubSub => write!(f, "pubsub"),
            Protocol::CometD => write!(f, "cometd"),
        }
    }
}

/// Recognized channel namespaces
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Namespace {
    /// Platform events (`/event/...`)
    Event,
    /// PushTopics (`/topic/...`)
    Topic,
    /// Change data capture (`/data/...`)
    DataCapture,
    /// System topics (`/systemTopic/...`)
    SystemTopic,
}

impl Namespace {
    /// Path segment as it appears in absolute channel names
    pub fn segment(&self) -> &'static str {
        match self {
            Namespace::Event => "event",
            Namespace::Topic => "topic",
            Namespace::DataCapture => "data",
            Namespace::SystemTopic => "systemTopic",
        }
    }

    /// The fixed routing table
    pub fn protocol(&self) -> Protocol {
        match self {
            Namespace::Event => Protocol::PubSub,
            Namespace::Topic | Namespace::DataCapture | Namespace::SystemTopic => Protocol::CometD,
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "event" => Some(Namespace::Event),
            "topic" => Some(Namespace::Topic),
            "data" => Some(Namespace::DataCapture),
            "systemTopic" => Some(Namespace::SystemTopic),
            _ => None,
        }
    }
}

/// Bare-name suffixes, most specific first
const SUFFIX_TABLE: &[(&str, Namespace)] = &[
    ("__ChangeEvent", Namespace::DataCapture),
    ("ChangeEvents", Namespace::DataCapture),
    ("ChangeEvent", Namespace::DataCapture),
    ("__e", Namespace::Event),
];

/// A channel after routing: its absolute name, namespace and protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRoute {
    /// Absolute channel name (`/event/Order_Event__e`)
    pub name: String,
    pub namespace: Namespace,
    pub protocol: Protocol,
}

/// Select the backend protocol for a channel name
///
/// Pure and total: every input yields a route or a `Protocol` error, and no
/// connection is attempted.
pub fn select_protocol(channel: &str) -> Result<ChannelRoute> {
    let channel = channel.trim();
    if channel.is_empty() {
        return Err(GatewayError::protocol("channel name is empty"));
    }
    if channel.chars().any(char::is_whitespace) {
        return Err(GatewayError::protocol(format!(
            "channel name '{}' contains whitespace",
            excerpt(channel)
        )));
    }

    if let Some(rest) = channel.strip_prefix('/') {
        let (segment, name) = rest.split_once('/').unwrap_or((rest, ""));
        let namespace = Namespace::from_segment(segment).ok_or_else(|| {
            GatewayError::protocol(format!("unrecognized channel namespace '/{}'", excerpt(segment)))
        })?;
        if name.is_empty() || name.split('/').any(|part| !is_identifier(part)) {
            return Err(GatewayError::protocol(format!(
                "channel '{}' has no valid name after its namespace",
                excerpt(channel)
            )));
        }
        return Ok(route(namespace, name));
    }

    if !is_identifier(channel) {
        return Err(GatewayError::protocol(format!(
            "unrecognized channel pattern '{}'",
            excerpt(channel)
        )));
    }

    let namespace = SUFFIX_TABLE
        .iter()
        .find(|(suffix, _)| channel.ends_with(suffix) && channel.len() > suffix.len())
        .map(|(_, namespace)| *namespace)
        .unwrap_or(Namespace::Topic);

    Ok(route(namespace, channel))
}

fn route(namespace: Namespace, name: &str) -> ChannelRoute {
    ChannelRoute {
        name: format!("/{}/{}", namespace.segment(), name),
        namespace,
        protocol: namespace.protocol(),
    }
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
