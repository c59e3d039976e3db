//! Replay markers: where a subscription starts reading

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Long-poll bus sentinel for "new events only"
pub const BAYEUX_REPLAY_LATEST: i64 = -1;

/// Long-poll bus sentinel for "all retained events"
pub const BAYEUX_REPLAY_EARLIEST: i64 = -2;

/// Position a subscription should begin receiving events from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayMarker {
    /// Only events published after the subscription starts
    #[default]
    Latest,
    /// Every event still retained by the platform
    Earliest,
    /// Resume after an explicit replay id
    Offset(u64),
}

impl ReplayMarker {
    /// Value placed in the long-poll bus `ext.replay` map
    pub fn bayeux_value(&self) -> i64 {
        match self {
            ReplayMarker::Latest => BAYEUX_REPLAY_LATEST,
            ReplayMarker::Earliest => BAYEUX_REPLAY_EARLIEST,
            ReplayMarker::Offset(offset) => i64::try_from(*offset).unwrap_or(i64::MAX),
        }
    }

    /// Replay id bytes for the streaming pub/sub endpoint (8-byte big-endian)
    pub fn replay_id_bytes(&self) -> Option<Vec<u8>> {
        match self {
            ReplayMarker::Offset(offset) => Some(offset.to_be_bytes().to_vec()),
            _ => None,
        }
    }

    fn from_signed(value: i64) -> Result<Self, String> {
        match value {
            BAYEUX_REPLAY_LATEST => Ok(ReplayMarker::Latest),
            BAYEUX_REPLAY_EARLIEST => Ok(ReplayMarker::Earliest),
            v if v >= 0 => Ok(ReplayMarker::Offset(v as u64)),
            v => Err(format!("replay marker {v} is not a valid offset")),
        }
    }
}

impl fmt::Display for ReplayMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayMarker::Latest => write!(f, "latest"),
            ReplayMarker::Earliest => write!(f, "earliest"),
            ReplayMarker::Offset(offset) => write!(f, "{offset}"),
        }
    }
}

impl Serialize for ReplayMarker {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ReplayMarker::Offset(offset) => serializer.serialize_u64(*offset),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for ReplayMarker {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => ReplayMarker::from_signed(n),
            Raw::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "latest" | "" => Ok(ReplayMarker::Latest),
                "earliest" => Ok(ReplayMarker::Earliest),
                other => other
                    .parse::<i64>()
                    .map_err(|_| format!("replay marker '{text}' is not latest, earliest or a number"))
                    .and_then(ReplayMarker::from_signed),
            },
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

/// Render a platform replay id for the client
///
/// Ids up to 8 bytes are read as big-endian integers so they can be fed back
/// as an explicit offset; longer ids are passed through as hex.
pub fn replay_id_to_json(bytes: &[u8]) -> serde_json::Value {
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    if bytes.len() <= 8 {
        let mut buf = [0u8; 8];
        buf[8 - bytes.len()..].copy_from_slice(bytes);
        serde_json::Value::from(u64::from_be_bytes(buf))
    } else {
        serde_json::Value::String(hex::encode(bytes))
    }
}
