//! Gateway-wide error types
//!
//! Every failure the gateway can report to its client maps onto one of the
//! variants below. Each variant carries a stable machine-readable code that is
//! echoed in error responses and `streamError` push frames.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Longest stretch of caller or upstream text quoted in an error message
pub const MAX_EXCERPT_CHARS: usize = 256;

/// Gateway-wide error type
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message")]
pub enum GatewayError {
    /// Malformed or oversized frame, or the narrow transport went away.
    /// Fatal to the whole session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unrecognized channel pattern or unsupported request type
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend authentication failure, refused connection, malformed upstream reply
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A request/response operation exceeded its deadline
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Missing or malformed parameters, rejected before any backend call
    #[error("Validation error: {0}")]
    Validation(String),

    /// A payload id that is unknown, expired or already read
    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Stable code sent to the client alongside the message
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Transport(_) => "TRANSPORT_ERROR",
            GatewayError::Protocol(_) => "PROTOCOL_ERROR",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::NotFound(_) => "NOT_FOUND",
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this error ends the whole session rather than one request
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

/// Text quoted in an error message, cut to [`MAX_EXCERPT_CHARS`] characters
pub fn excerpt(text: &str) -> Cow<'_, str> {
    excerpt_to(text, MAX_EXCERPT_CHARS)
}

/// [`excerpt`] with an explicit character limit
pub fn excerpt_to(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => Cow::Owned(format!("{}... ({} bytes)", &text[..end], text.len())),
        None => Cow::Borrowed(text),
    }
}

impl From<GatewayError> for String {
    fn from(error: GatewayError) -> String {
        error.to_string()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GatewayError>;

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GatewayError::transport("x").code(), "TRANSPORT_ERROR");
        assert_eq!(GatewayError::protocol("x").code(), "PROTOCOL_ERROR");
        assert_eq!(GatewayError::upstream("x").code(), "UPSTREAM_ERROR");
        assert_eq!(GatewayError::Timeout(30_000).code(), "TIMEOUT");
        assert_eq!(GatewayError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(GatewayError::NotFound("x".into()).code(), "NOT_FOUND");
    }

    #[test]
    fn test_only_transport_is_fatal() {
        assert!(GatewayError::transport("closed").is_fatal());
        assert!(!GatewayError::upstream("refused").is_fatal());
        assert!(!GatewayError::Timeout(1).is_fatal());
    }

    #[test]
    fn test_error_serialization() {
        let err = GatewayError::protocol("unsupported request type 'frobnicate'");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"Protocol\""));

        let parsed: GatewayError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn test_excerpt_bounds_long_input() {
        assert_eq!(excerpt("short"), "short");

        let long = "é".repeat(10_000);
        let cut = excerpt(&long);
        assert!(cut.starts_with(&"é".repeat(MAX_EXCERPT_CHARS)));
        assert!(cut.ends_with("... (20000 bytes)"));
        assert!(cut.len() < 600);
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(
            GatewayError::Timeout(30_000).to_string(),
            "Request timed out after 30000 ms"
        );
    }
}
