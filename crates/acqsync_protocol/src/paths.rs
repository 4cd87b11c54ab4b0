use std::path::PathBuf;

/// Resolve the agent home directory.
///
/// Priority:
/// 1) ACQSYNC_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.acqsync
pub fn acqsync_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("ACQSYNC_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".acqsync");
    }
    PathBuf::from(".").join(".acqsync")
}

/// Default config path: ~/.acqsync/config.toml
pub fn default_config_path() -> PathBuf {
    acqsync_home().join("config.toml")
}

/// Default logs directory: ~/.acqsync/logs
pub fn default_logs_dir() -> PathBuf {
    acqsync_home().join("logs")
}
