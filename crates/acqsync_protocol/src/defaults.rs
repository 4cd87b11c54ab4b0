//! Canonical default values shared across the agent crates.

// Watcher
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_EXCLUDE_SUBSTRINGS: &[&str] = &["textual"];
/// Browsers and some instrument exporters write to `<name>.downloading` until done.
pub const IN_PROGRESS_SUFFIX: &str = "downloading";

// Transfer
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;
pub const DEFAULT_RSYNC_BINARY: &str = "rsync";

// Acquisition contexts
pub const DATA_SUFFIXES: &[&str] = &["mrc", "tiff", "tif", "eer"];
pub const DEFAULT_TOMO_SOFTWARE: &str = "tomo";
pub const DEFAULT_TOMO_VERSION: &str = "5.7";

// Coordinator channel
pub const DEFAULT_COORDINATOR_URL: &str = "http://127.0.0.1:8000";
pub const WEBSOCKET_PATH_PREFIX: &str = "/ws/test";
pub const RAPID_DISCONNECT_THRESHOLD_SECS: u64 = 5;
pub const BACKOFF_CAP_SECS: u64 = 120;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 20;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 10;
