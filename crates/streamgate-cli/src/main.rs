//! Streamgate CLI
//!
//! Local streaming gateway launched by a host application. The client talks
//! to it over stdin/stdout with length-prefixed JSON frames; the gateway
//! fans requests out to the platform's Pub/Sub gRPC API, its CometD bus and
//! its REST endpoints.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use streamgate_core::{GatewayConfig, Result, GATEWAY_VERSION};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod aux_server;
mod cometd;
mod host;
mod pubsub;
mod relay;
mod router;
mod session;

use session::Session;

/// Streamgate - local gateway for streaming and REST platform APIs
///
/// Speaks length-framed JSON on stdin/stdout. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "streamgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(short, long, env = "STREAMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Deadline for request/response operations, in milliseconds
    #[arg(long, env = "STREAMGATE_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Results larger than this many bytes are served by the auxiliary server
    #[arg(long, env = "STREAMGATE_PAYLOAD_THRESHOLD")]
    payload_threshold: Option<usize>,

    /// Seconds an unread large payload stays retrievable
    #[arg(long, env = "STREAMGATE_PAYLOAD_TTL_SECS")]
    payload_ttl_secs: Option<u64>,

    /// Loopback port for the auxiliary server (0 = ephemeral)
    #[arg(long, env = "STREAMGATE_AUX_PORT")]
    aux_port: Option<u16>,

    /// Pub/Sub gRPC endpoint
    #[arg(long, env = "STREAMGATE_PUBSUB_ENDPOINT")]
    pubsub_endpoint: Option<String>,

    /// API version used for the CometD endpoint
    #[arg(long, env = "STREAMGATE_API_VERSION")]
    api_version: Option<String>,

    /// Extra relay target host; a leading dot allows a whole domain
    #[arg(long = "allow-host", value_name = "HOST")]
    allow_host: Vec<String>,

    /// Also write a daily rolling log file in this directory
    #[arg(long, env = "STREAMGATE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Window handle some hosts append on Windows
    #[arg(long, hide = true)]
    parent_window: Option<String>,

    /// Caller origin and other positional arguments passed by the host
    #[arg(hide = true)]
    origin: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_deref());

    if !args.origin.is_empty() || args.parent_window.is_some() {
        info!(origin = ?args.origin, parent_window = ?args.parent_window, "Ignoring host-supplied arguments");
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (session, frames) = match Session::new(config) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start session: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(version = GATEWAY_VERSION, "Starting streamgate");

    match host::run(session, frames, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => {
            info!("Session ended");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Session ended with error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// stdout is the transport, so every log line goes to stderr (and
/// optionally a file)
fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "streamgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::new(),
    };

    if let Some(ms) = args.request_timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }
    if let Some(bytes) = args.payload_threshold {
        config = config.with_payload_threshold(bytes);
    }
    if let Some(ttl) = args.payload_ttl_secs {
        config.payloads.ttl_secs = ttl;
    }
    if let Some(port) = args.aux_port {
        config.aux_server.port = port;
    }
    if let Some(endpoint) = &args.pubsub_endpoint {
        config.platform.pubsub_endpoint = endpoint.clone();
    }
    if let Some(version) = &args.api_version {
        config.platform.api_version = version.clone();
    }
    for host in &args.allow_host {
        config = config.allow_relay_host(host.clone());
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "streamgate",
            "--request-timeout-ms",
            "5000",
            "--aux-port",
            "4100",
            "--allow-host",
            "localhost",
            "chrome-extension://abcdefghijklmnop/",
        ]);
        assert_eq!(args.origin, vec!["chrome-extension://abcdefghijklmnop/"]);

        let config = load_config(&args).unwrap();
        assert_eq!(config.requests.timeout_ms, 5000);
        assert_eq!(config.aux_server.port, 4100);
        assert!(config.platform.allows_host("localhost"));
        assert!(config.platform.allows_host("acme.my.salesforce.com"));
    }

    #[test]
    fn test_threshold_above_frame_ceiling_is_rejected() {
        let args = Args::parse_from(["streamgate", "--payload-threshold", "2000000"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_windows_parent_window_flag_is_accepted() {
        let args = Args::try_parse_from([
            "streamgate",
            "chrome-extension://abcdefghijklmnop/",
            "--parent-window=0",
        ])
        .unwrap();
        assert_eq!(args.parent_window.as_deref(), Some("0"));
    }
}
