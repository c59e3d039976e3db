use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use super::defaults;
use crate::error::{GatewayError, Result};

/// Gateway configuration
///
/// Loaded from an optional JSON file and then overridden by command-line
/// flags. Every section falls back to the values in [`defaults`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub transport: TransportConfig,
    pub payloads: PayloadConfig,
    pub requests: RequestConfig,
    pub aux_server: AuxServerConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    pub max_inbound_frame_bytes: usize,
    pub max_outbound_frame_bytes: usize,
    pub outbound_queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_inbound_frame_bytes: defaults::DEFAULT_MAX_INBOUND_FRAME_BYTES,
            max_outbound_frame_bytes: defaults::DEFAULT_MAX_OUTBOUND_FRAME_BYTES,
            outbound_queue_depth: defaults::DEFAULT_OUTBOUND_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PayloadConfig {
    /// Results above this size travel through the auxiliary server
    pub threshold_bytes: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: defaults::DEFAULT_PAYLOAD_THRESHOLD_BYTES,
            ttl_secs: defaults::DEFAULT_PAYLOAD_TTL_SECS,
            sweep_interval_secs: defaults::DEFAULT_PAYLOAD_SWEEP_INTERVAL_SECS,
        }
    }
}

impl PayloadConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestConfig {
    pub timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuxServerConfig {
    pub port: u16,
}

impl Default for AuxServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::DEFAULT_AUX_PORT,
        }
    }
}

impl AuxServerConfig {
    /// The auxiliary server only ever binds the loopback interface
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlatformConfig {
    pub api_version: String,
    pub pubsub_endpoint: String,
    pub fetch_batch_size: i32,
    pub event_queue_depth: usize,
    /// Host suffixes (".example.com") or exact hosts the relay may reach
    pub relay_allowed_hosts: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_version: defaults::DEFAULT_API_VERSION.to_string(),
            pubsub_endpoint: defaults::DEFAULT_PUBSUB_ENDPOINT.to_string(),
            fetch_batch_size: defaults::DEFAULT_FETCH_BATCH_SIZE,
            event_queue_depth: defaults::DEFAULT_EVENT_QUEUE_DEPTH,
            relay_allowed_hosts: defaults::DEFAULT_RELAY_ALLOWED_HOSTS
                .iter()
                .map(|h| h.to_string())
                .collect(),
        }
    }
}

impl PlatformConfig {
    /// Check a relay target host against the allow-list
    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.relay_allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            if allowed.starts_with('.') {
                host.ends_with(&allowed) || host == allowed[1..]
            } else {
                host == allowed
            }
        })
    }
}

impl GatewayConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file; missing sections keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::validation(format!("Failed to read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GatewayError::validation(format!("Failed to parse config {}: {e}", path.display()))
        })
    }

    /// Builder method for the request deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.requests.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method for the payload overflow threshold
    pub fn with_payload_threshold(mut self, bytes: usize) -> Self {
        self.payloads.threshold_bytes = bytes;
        self
    }

    /// Builder method for an extra relay host
    pub fn allow_relay_host(mut self, host: impl Into<String>) -> Self {
        self.platform.relay_allowed_hosts.push(host.into());
        self
    }

    /// Reject settings that would break the overflow contract
    pub fn validate(&self) -> Result<()> {
        if self.payloads.threshold_bytes >= self.transport.max_outbound_frame_bytes {
            return Err(GatewayError::validation(format!(
                "payload threshold ({}) must be below the outbound frame ceiling ({})",
                self.payloads.threshold_bytes, self.transport.max_outbound_frame_bytes
            )));
        }
        if self.platform.fetch_batch_size <= 0 {
            return Err(GatewayError::validation("fetch batch size must be positive"));
        }
        if self.requests.timeout_ms == 0 {
            return Err(GatewayError::validation("request timeout must be non-zero"));
        }
        Ok(())
    }
}
