/// Largest inbound frame accepted from the client (64 MiB)
pub const DEFAULT_MAX_INBOUND_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Hard ceiling the client enforces on messages it receives (1 MiB)
pub const DEFAULT_MAX_OUTBOUND_FRAME_BYTES: usize = 1024 * 1024;

/// Frames queued for the stdout writer before producers wait
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Outbound results larger than this are diverted to the payload store
pub const DEFAULT_PAYLOAD_THRESHOLD_BYTES: usize = 800_000;

/// How long an unread payload stays retrievable (seconds)
pub const DEFAULT_PAYLOAD_TTL_SECS: u64 = 60;

/// How often expired payloads are swept (seconds)
pub const DEFAULT_PAYLOAD_SWEEP_INTERVAL_SECS: u64 = 10;

/// Deadline for request/response operations (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Loopback port for the auxiliary server; 0 picks an ephemeral port
pub const DEFAULT_AUX_PORT: u16 = 0;

/// REST / streaming API version used for the long-poll bus endpoint
pub const DEFAULT_API_VERSION: &str = "60.0";

/// Pub/Sub gRPC endpoint
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://api.pubsub.salesforce.com:7443";

/// Events requested per Pub/Sub FetchRequest
pub const DEFAULT_FETCH_BATCH_SIZE: i32 = 100;

/// Per-subscription event queue between a backend and the registry
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 128;

/// Host suffixes the plain relay may target
pub const DEFAULT_RELAY_ALLOWED_HOSTS: &[&str] = &[
    ".salesforce.com",
    ".force.com",
    ".salesforce-setup.com",
    ".cloudforce.com",
    ".visualforce.com",
];
