//! Client-facing message types
//!
//! Inbound frames are JSON objects carrying an `id`, a `type` from a closed
//! set and flat type-specific parameters. Outbound frames are either
//! responses correlated by `id` or unsolicited push frames scoped to a
//! subscription.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::channel::Protocol;
use crate::credential::CredentialParams;
use crate::error::{excerpt, GatewayError};
use crate::replay::ReplayMarker;

/// Longest string accepted as a request id
pub const MAX_ID_CHARS: usize = 256;

/// Caller-supplied correlation id, echoed verbatim in the response
///
/// Strings and numbers are accepted; anything else is rejected as a
/// validation error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(Value);

impl TryFrom<Value> for RequestId {
    type Error = GatewayError;

    fn try_from(value: Value) -> Result<Self, GatewayError> {
        match value {
            Value::String(ref id) if id.chars().count() > MAX_ID_CHARS => Err(
                GatewayError::validation(format!("request id is longer than {MAX_ID_CHARS} characters")),
            ),
            Value::String(_) | Value::Number(_) => Ok(Self(value)),
            other => Err(GatewayError::validation(format!(
                "request id must be a string or number, got {}",
                excerpt(&other.to_string())
            ))),
        }
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(Value::String(id.to_string()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Init,
    Ping,
    Rest,
    TokenExchange,
    Subscribe,
    Unsubscribe,
    GetSchema,
    GetTopic,
}

impl RequestType {
    pub const ALL: [RequestType; 8] = [
        RequestType::Init,
        RequestType::Ping,
        RequestType::Rest,
        RequestType::TokenExchange,
        RequestType::Subscribe,
        RequestType::Unsubscribe,
        RequestType::GetSchema,
        RequestType::GetTopic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Init => "init",
            RequestType::Ping => "ping",
            RequestType::Rest => "rest",
            RequestType::TokenExchange => "tokenExchange",
            RequestType::Subscribe => "subscribe",
            RequestType::Unsubscribe => "unsubscribe",
            RequestType::GetSchema => "getSchema",
            RequestType::GetTopic => "getTopic",
        }
    }

    /// Streaming requests reply at once and are not tracked as pending
    pub fn is_correlated(&self) -> bool {
        !matches!(self, RequestType::Subscribe | RequestType::Unsubscribe)
    }
}

impl FromStr for RequestType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, GatewayError> {
        RequestType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| GatewayError::protocol(format!("unsupported request type '{}'", excerpt(s))))
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain relay parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RestParams {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Binary request body; mutually exclusive with `body`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Authorization-code exchange parameters, forwarded as given
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenExchangeParams {
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub login_url: Option<String>,
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub code_verifier: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

const TOKEN_PATH: &str = "/services/oauth2/token";

impl TokenExchangeParams {
    /// Token endpoint: `tokenUrl` verbatim, else `<loginUrl>/services/oauth2/token`
    pub fn endpoint(&self) -> Result<String, GatewayError> {
        if let Some(url) = self.token_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.trim().to_string());
        }
        if let Some(login) = self.login_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(format!("{}{TOKEN_PATH}", login.trim().trim_end_matches('/')));
        }
        Err(GatewayError::validation(
            "tokenExchange requires tokenUrl or loginUrl",
        ))
    }

    /// Form fields for the `authorization_code` grant
    pub fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", self.code.clone()),
            ("client_id", self.client_id.clone()),
            ("redirect_uri", self.redirect_uri.clone()),
        ];
        if let Some(verifier) = &self.code_verifier {
            form.push(("code_verifier", verifier.clone()));
        }
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        form
    }
}

impl fmt::Debug for TokenExchangeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenExchangeParams")
            .field("token_url", &self.token_url)
            .field("login_url", &self.login_url)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub channel: String,
    #[serde(flatten)]
    pub credential: CredentialParams,
    #[serde(default)]
    pub replay: ReplayMarker,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeParams {
    pub subscription_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaParams {
    pub schema_id: String,
    #[serde(flatten)]
    pub credential: CredentialParams,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopicParams {
    pub topic_name: String,
    #[serde(flatten)]
    pub credential: CredentialParams,
}

/// A request body, discriminated by its `type` field
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    Init,
    Ping,
    Rest(RestParams),
    TokenExchange(TokenExchangeParams),
    Subscribe(SubscribeParams),
    Unsubscribe(UnsubscribeParams),
    GetSchema(SchemaParams),
    GetTopic(TopicParams),
}

impl Request {
    pub fn kind(&self) -> RequestType {
        match self {
            Request::Init => RequestType::Init,
            Request::Ping => RequestType::Ping,
            Request::Rest(_) => RequestType::Rest,
            Request::TokenExchange(_) => RequestType::TokenExchange,
            Request::Subscribe(_) => RequestType::Subscribe,
            Request::Unsubscribe(_) => RequestType::Unsubscribe,
            Request::GetSchema(_) => RequestType::GetSchema,
            Request::GetTopic(_) => RequestType::GetTopic,
        }
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub id: RequestId,
    pub request: Request,
}

/// A frame that could not be turned into a request
///
/// `id` is present whenever the frame carried a usable one, so the error
/// response can still be correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedFrame {
    pub id: Option<RequestId>,
    pub error: GatewayError,
}

impl RequestFrame {
    /// Decode a frame body
    ///
    /// Unknown types are protocol errors; known types with bad parameters
    /// are validation errors.
    pub fn parse(body: &[u8]) -> Result<Self, RejectedFrame> {
        let reject = |id: Option<RequestId>, error: GatewayError| RejectedFrame { id, error };

        let value: Value = serde_json::from_slice(body).map_err(|e| {
            reject(None, GatewayError::validation(format!("frame is not valid JSON: {}", excerpt(&e.to_string()))))
        })?;
        let Value::Object(fields) = &value else {
            return Err(reject(None, GatewayError::validation("frame is not a JSON object")));
        };

        let id = match fields.get("id") {
            Some(raw) => RequestId::try_from(raw.clone()).map_err(|e| reject(None, e))?,
            None => return Err(reject(None, GatewayError::validation("request has no id"))),
        };

        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind
                .parse::<RequestType>()
                .map_err(|e| reject(Some(id.clone()), e))?,
            Some(_) => {
                return Err(reject(
                    Some(id),
                    GatewayError::validation("request type must be a string"),
                ))
            }
            None => return Err(reject(Some(id), GatewayError::validation("request has no type"))),
        };

        let request = serde_json::from_value::<Request>(value).map_err(|e| {
            reject(
                Some(id.clone()),
                GatewayError::validation(format!(
                    "invalid {kind} parameters: {}",
                    excerpt(&e.to_string())
                )),
            )
        })?;

        Ok(Self { id, request })
    }
}

/// Outcome carried by a response frame
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Outcome {
    Success { result: Value },
    Failure { error: String, code: &'static str },
}

/// A response correlated to a request by id
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseFrame {
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl ResponseFrame {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success { result },
        }
    }

    pub fn failure(id: Option<RequestId>, error: &GatewayError) -> Self {
        Self {
            id,
            outcome: Outcome::Failure {
                error: error.to_string(),
                code: error.code(),
            },
        }
    }

    pub fn from_result(id: Option<RequestId>, result: Result<Value, GatewayError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(error) => Self::failure(id, &error),
        }
    }
}

/// Unsolicited frames scoped to one subscription
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PushFrame {
    StreamEvent {
        subscription_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        large_payload_id: Option<String>,
    },
    StreamError {
        subscription_id: String,
        error: String,
        code: &'static str,
    },
    StreamEnd {
        subscription_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl PushFrame {
    pub fn event(subscription_id: impl Into<String>, event: Value) -> Self {
        PushFrame::StreamEvent {
            subscription_id: subscription_id.into(),
            event: Some(event),
            large_payload_id: None,
        }
    }

    pub fn error(subscription_id: impl Into<String>, error: &GatewayError) -> Self {
        PushFrame::StreamError {
            subscription_id: subscription_id.into(),
            error: error.to_string(),
            code: error.code(),
        }
    }

    pub fn end(subscription_id: impl Into<String>, reason: Option<String>) -> Self {
        PushFrame::StreamEnd {
            subscription_id: subscription_id.into(),
            reason,
        }
    }

    pub fn subscription_id(&self) -> &str {
        match self {
            PushFrame::StreamEvent {
                subscription_id, ..
            }
            | PushFrame::StreamError {
                subscription_id, ..
            }
            | PushFrame::StreamEnd {
                subscription_id, ..
            } => subscription_id,
        }
    }
}

/// `init` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    pub version: String,
    pub http_port: u16,
    pub secret: String,
}

/// `ping` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingResult {
    pub version: String,
}

/// `subscribe` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResult {
    pub subscription_id: String,
    pub channel: String,
    pub protocol: Protocol,
}

/// `unsubscribe` result; `cancelled` is false for ids that were already gone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResult {
    pub subscription_id: String,
    pub cancelled: bool,
}
