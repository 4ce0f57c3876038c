/// Default TCP port the orchestrator listens on.
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind address for the device listener.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Bid collection window for the socket orchestrator.
pub const DEFAULT_BID_DEADLINE_MS: u64 = 5_000;

/// How long an assigned task waits for its winner's result.
pub const DEFAULT_RESULT_TIMEOUT_MS: u64 = 300_000;

/// Capability assumed for image task sources that name none.
pub const DEFAULT_CAPABILITY: &str = "classify";

/// Number of (task, device, utilization, confidence) observations retained.
pub const SCORE_HISTORY_LEN: usize = 10;

/// Upper bound on bytes buffered for a single connection without a
/// complete message. Base64 images make frames large.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Per-connection outbound queue depth.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// A device reporting more CPU load than this is considered overloaded.
pub const OVERLOAD_CPU_THRESHOLD: f64 = 0.8;

/// A device reporting less battery than this is considered overloaded.
pub const OVERLOAD_BATTERY_THRESHOLD: f64 = 20.0;

/// Load assumed for a bid or result when the device never reported one.
pub const UNKNOWN_CPU_LOAD: f64 = 1.0;

/// Utilization and confidence assumed for results lacking them.
pub const DEFAULT_RESULT_SCORE: f64 = 0.5;
