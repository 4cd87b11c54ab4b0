//! Logging setup for the acquisition agent.
//!
//! Two sinks: a daily-rolled file under `~/.acqsync/logs/<app>.<date>.log`
//! that always receives the full filter, and stderr. The file survives the
//! session so operators can inspect failed transfers after the fact.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "acqsync=info,acqsync_scout=info,acqsync_worker=info,acqsync_context=info,acqsync_channel=info";
/// Days of log files kept next to the current one
const MAX_LOG_FILES: usize = 7;

/// Logging configuration for agent binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Log debug to stderr regardless of `RUST_LOG`.
    pub verbose: bool,
    /// Override the log directory (defaults to [`logs_dir`]).
    pub log_dir: Option<PathBuf>,
}

/// Keeps the background file writer alive; buffered lines are flushed
/// when it is dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _file_guard: WorkerGuard,
}

/// Initialize tracing with a daily-rolled file and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogGuard> {
    let log_dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir()?,
    };
    let appender = file_appender(&log_dir, config.app_name)?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Global tracing subscriber already set")?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Agent home directory: `$ACQSYNC_HOME` or `~/.acqsync`.
pub fn acqsync_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("ACQSYNC_HOME") {
        return Ok(PathBuf::from(override_path));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".acqsync"))
}

/// Logs directory: `<home>/logs`.
pub fn logs_dir() -> Result<PathBuf> {
    Ok(acqsync_home()?.join("logs"))
}

/// Daily appender writing `<app>.<date>.log` in `dir`, pruned to
/// [`MAX_LOG_FILES`].
fn file_appender(dir: &Path, app_name: &str) -> Result<RollingFileAppender> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(sanitize_name(app_name))
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .with_context(|| format!("Failed to open log file for {} in {}", app_name, dir.display()))
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn log_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("acqsync agent/1"), "acqsync_agent_1");
        assert_eq!(sanitize_name("acq-sync_2"), "acq-sync_2");
    }

    #[test]
    fn test_appender_creates_dated_file_under_missing_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("logs/nested");

        let mut appender = file_appender(&dir, "acqsync agent").unwrap();
        appender.write_all(b"first line\n").unwrap();
        appender.flush().unwrap();

        let names = log_files(&dir);
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("acqsync_agent."));
        assert!(names[0].ends_with(".log"));
        let content = fs::read_to_string(dir.join(&names[0])).unwrap();
        assert_eq!(content, "first line\n");
    }

    #[test]
    fn test_reopen_appends_to_todays_file() {
        let temp = TempDir::new().unwrap();
        {
            let mut appender = file_appender(temp.path(), "agent").unwrap();
            appender.write_all(b"first\n").unwrap();
        }
        let mut appender = file_appender(temp.path(), "agent").unwrap();
        appender.write_all(b"second\n").unwrap();
        appender.flush().unwrap();

        let names = log_files(temp.path());
        assert_eq!(names.len(), 1);
        let content = fs::read_to_string(temp.path().join(&names[0])).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
