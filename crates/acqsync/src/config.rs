//! Agent configuration, loaded from TOML.
//!
//! ```toml
//! [[sources]]
//! root = "/mnt/krios/Session1"
//! destination = "/dls/m02/data/cm12345-1/raw"
//! settling_secs = 30
//! tomo_version = "5.12"
//!
//! [transfer]
//! max_attempts = 3
//! retry_delay_ms = 2000
//!
//! [coordinator]
//! url = "http://coordinator:8000"
//! client_id = 7
//! ```

use acqsync_channel::ChannelConfig;
use acqsync_context::{ContextConfig, ContextKind};
use acqsync_protocol::defaults::{
    BACKOFF_CAP_SECS, DEFAULT_COORDINATOR_URL, DEFAULT_DRAIN_TIMEOUT_SECS,
    DEFAULT_EXCLUDE_SUBSTRINGS, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_TIMEOUT_SECS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_RETRY_DELAY_MS, DEFAULT_RSYNC_BINARY,
    DEFAULT_TOMO_SOFTWARE, DEFAULT_TOMO_VERSION,
};
use acqsync_scout::WatchConfig;
use acqsync_worker::{RetryPolicy, RsyncTool};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Instrument output directories to watch
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub transfer: TransferConfig,

    /// Omit to run without a coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub root: PathBuf,
    pub destination: PathBuf,

    /// Label used in state keys; defaults to the root's directory name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Quiet period before a file is released; unset releases on sight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settling_secs: Option<u64>,

    #[serde(default)]
    pub include_hidden: bool,

    #[serde(default = "default_exclude_substrings")]
    pub exclude_substrings: Vec<String>,

    /// Skip classification and use this context from the first file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextKind>,

    #[serde(default = "default_tomo_software")]
    pub tomo_software: String,

    #[serde(default = "default_tomo_version")]
    pub tomo_version: String,

    /// Substrings a tilt image name must contain
    #[serde(default)]
    pub required_substrings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_rsync_binary")]
    pub rsync_binary: PathBuf,

    /// Appended after the default `-v -p -t -o -g`
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait before resubmitting failed files
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_coordinator_url")]
    pub url: String,

    #[serde(default)]
    pub client_id: u32,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_exclude_substrings() -> Vec<String> {
    DEFAULT_EXCLUDE_SUBSTRINGS.iter().map(|s| s.to_string()).collect()
}

fn default_tomo_software() -> String {
    DEFAULT_TOMO_SOFTWARE.to_string()
}

fn default_tomo_version() -> String {
    DEFAULT_TOMO_VERSION.to_string()
}

fn default_rsync_binary() -> PathBuf {
    PathBuf::from(DEFAULT_RSYNC_BINARY)
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_coordinator_url() -> String {
    DEFAULT_COORDINATOR_URL.to_string()
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}

fn default_drain_timeout() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

fn default_backoff_cap() -> u64 {
    BACKOFF_CAP_SECS
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rsync_binary: default_rsync_binary(),
            extra_args: Vec::new(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: default_coordinator_url(),
            client_id: 0,
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// A starting point for `init-config`.
    pub fn example() -> Self {
        Self {
            sources: vec![SourceConfig::new("/data/acquisition", "/data/transfer")],
            transfer: TransferConfig::default(),
            coordinator: Some(CoordinatorConfig::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.max_attempts == 0 {
            bail!("transfer.max_attempts must be at least 1");
        }
        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if source.root.as_os_str().is_empty() || source.destination.as_os_str().is_empty() {
                bail!("every source needs both root and destination");
            }
            if !names.insert(source.display_name()) {
                bail!(
                    "duplicate source name '{}'; set `name` to tell them apart",
                    source.display_name()
                );
            }
        }
        Ok(())
    }
}

impl SourceConfig {
    pub fn new(root: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            destination: destination.into(),
            name: None,
            poll_interval_secs: default_poll_interval(),
            settling_secs: None,
            include_hidden: false,
            exclude_substrings: default_exclude_substrings(),
            context: None,
            tomo_software: default_tomo_software(),
            tomo_version: default_tomo_version(),
            required_substrings: Vec::new(),
        }
    }

    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }

    pub fn watch_config(&self) -> WatchConfig {
        let mut config = WatchConfig::new(&self.root)
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs));
        if let Some(secs) = self.settling_secs {
            config = config.with_settling(Duration::from_secs(secs));
        }
        config.include_hidden = self.include_hidden;
        config.exclude_substrings = self.exclude_substrings.clone();
        config
    }

    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            tomo_software: self.tomo_software.clone(),
            tomo_version: self.tomo_version.clone(),
            required_substrings: self.required_substrings.clone(),
        }
    }
}

impl TransferConfig {
    pub fn rsync(&self) -> RsyncTool {
        RsyncTool::new(&self.rsync_binary).with_extra_args(self.extra_args.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(self.max_attempts).with_delay(Duration::from_millis(self.retry_delay_ms))
    }
}

impl CoordinatorConfig {
    pub fn channel_config(&self) -> Result<ChannelConfig> {
        let mut config = ChannelConfig::for_client(&self.url, self.client_id)
            .with_context(|| format!("Invalid coordinator url: {}", self.url))?;
        config.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs);
        config.heartbeat_timeout = Duration::from_secs(self.heartbeat_timeout_secs);
        config.drain_timeout = Duration::from_secs(self.drain_timeout_secs);
        config.backoff_cap = Duration::from_secs(self.backoff_cap_secs);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_source_gets_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            [[sources]]
            root = "/mnt/krios/Session1"
            destination = "/store/raw"
            "#,
        )
        .unwrap();

        let source = &config.sources[0];
        assert_eq!(source.poll_interval_secs, 15);
        assert_eq!(source.settling_secs, None);
        assert_eq!(source.exclude_substrings, vec!["textual"]);
        assert_eq!(source.tomo_version, "5.7");
        assert_eq!(source.display_name(), "Session1");
        assert_eq!(config.transfer.max_attempts, 3);
        assert_eq!(
            config.transfer.retry_policy().delay,
            Duration::from_millis(2000)
        );
        assert!(config.coordinator.is_none());
    }

    #[test]
    fn test_context_and_coordinator_sections() {
        let config: AgentConfig = toml::from_str(
            r#"
            [[sources]]
            root = "/a"
            destination = "/b"
            context = "tomography"
            tomo_software = "serialem"

            [coordinator]
            url = "https://coord.example"
            client_id = 4
            drain_timeout_secs = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.sources[0].context, Some(ContextKind::Tomography));
        let channel = config.coordinator.unwrap().channel_config().unwrap();
        assert_eq!(channel.url.as_str(), "wss://coord.example/ws/test/4");
        assert_eq!(channel.drain_timeout, Duration::from_secs(2));
        assert_eq!(channel.heartbeat_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");
        let config = AgentConfig::example();
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.sources.len(), 1);
        assert_eq!(loaded.sources[0].root, PathBuf::from("/data/acquisition"));
        assert_eq!(loaded.coordinator.unwrap().url, DEFAULT_COORDINATOR_URL);
    }

    #[test]
    fn test_validation() {
        let mut config = AgentConfig::example();
        config.transfer.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::example();
        config.sources.push(SourceConfig::new("/other/acquisition", "/x"));
        assert!(config.validate().is_err());
        config.sources[1].name = Some("second".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watch_config_from_source() {
        let mut source = SourceConfig::new("/a", "/b");
        source.settling_secs = Some(30);
        source.include_hidden = true;
        let watch = source.watch_config();
        assert_eq!(watch.settling_delay, Some(Duration::from_secs(30)));
        assert_eq!(watch.poll_interval, Duration::from_secs(15));
        assert!(watch.include_hidden);
    }
}
