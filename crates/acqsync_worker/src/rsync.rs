//! Copy tool invocation and rsync output parsing
//!
//! The text rsync prints with `-v` is the contract the transfer pipe relies
//! on:
//!
//! ```text
//! sending incremental file list
//! Position_1_[0.0].tiff
//! Position_1_[3.0].tiff
//!
//! sent 1,048,862 bytes  received 54 bytes  2,097,832.00 bytes/sec
//! total size is 1,048,576  speedup is 1.00
//! ```
//!
//! and on stderr, for sources that vanished before the copy ran:
//!
//! ```text
//! rsync: [sender] link_stat "/data/Position_1_[6.0].tiff" failed: No such file or directory (2)
//! ```
//!
//! Any substitute [`CopyTool`] must produce the same shapes.

use crate::error::{Result, TransferError};
use acqsync_protocol::defaults::DEFAULT_RSYNC_BINARY;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::debug;

/// One invocation of the copy tool.
#[derive(Debug, Clone, Copy)]
pub struct CopyRequest<'a> {
    pub sources: &'a [PathBuf],
    /// Directory the sources land in
    pub destination_dir: &'a Path,
    /// Single-source copies may be renamed on arrival
    pub rename_to: Option<&'a str>,
}

/// Raw result of an invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// External file-copy operation.
pub trait CopyTool: Send {
    fn copy(&mut self, request: &CopyRequest<'_>) -> Result<CopyOutput>;
}

/// Production copy tool: `rsync -v -p -t -o -g`.
#[derive(Debug, Clone)]
pub struct RsyncTool {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl Default for RsyncTool {
    fn default() -> Self {
        Self::new(DEFAULT_RSYNC_BINARY)
    }
}

impl RsyncTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    /// Resolve `rsync` on PATH.
    pub fn locate() -> Result<Self> {
        let binary = which::which(DEFAULT_RSYNC_BINARY)
            .map_err(|_| TransferError::ToolNotFound(DEFAULT_RSYNC_BINARY.to_string()))?;
        Ok(Self::new(binary))
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, request: &CopyRequest<'_>) -> Command {
        let target = match request.rename_to {
            Some(name) => request.destination_dir.join(name).into_os_string(),
            None => {
                let mut dir = request.destination_dir.as_os_str().to_os_string();
                if !dir.to_string_lossy().ends_with('/') {
                    dir.push("/");
                }
                dir
            }
        };

        let mut cmd = Command::new(&self.binary);
        // -p/-t/-o/-g: permissions, times, owner and group. Owner is only
        // applied when the receiving side runs as root.
        cmd.args(["-v", "-p", "-t", "-o", "-g"])
            .args(&self.extra_args)
            .args(request.sources)
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl CopyTool for RsyncTool {
    fn copy(&mut self, request: &CopyRequest<'_>) -> Result<CopyOutput> {
        if !is_remote_destination(request.destination_dir) {
            std::fs::create_dir_all(request.destination_dir)?;
        }

        let mut cmd = self.command(request);
        debug!(command = ?cmd, "Running copy tool");
        let output = cmd.output().map_err(|source| TransferError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;

        Ok(CopyOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// rsync treats `host:path` (colon before any slash) as remote.
fn is_remote_destination(dest: &Path) -> bool {
    let text = dest.to_string_lossy();
    match (text.find(':'), text.find('/')) {
        (Some(colon), Some(slash)) => colon < slash,
        (Some(_), None) => true,
        _ => false,
    }
}

// ============================================================================
// Output parsing
// ============================================================================

/// Aggregate byte counters reported by the tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub bytes_per_sec: f64,
    pub total_size: u64,
}

impl TransferStats {
    /// Fold another invocation's counters in. Rate is the latest observed.
    pub fn accumulate(&mut self, other: &TransferStats) {
        self.sent_bytes += other.sent_bytes;
        self.received_bytes += other.received_bytes;
        self.bytes_per_sec = other.bytes_per_sec;
        self.total_size += other.total_size;
    }
}

/// What stdout said about one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedStdout {
    /// Names listed while transferring, in tool order
    pub transferred: Vec<String>,
    pub stats: Option<TransferStats>,
}

const BANNER_PREFIXES: &[&str] = &[
    "sending incremental file list",
    "building file list",
    "receiving incremental file list",
    "created directory",
    "delta-transmission",
];

fn sent_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^sent\s+([\d,]+)\s+bytes\s+received\s+([\d,]+)\s+bytes\s+([\d,.]+)\s+bytes/sec")
            .expect("static regex")
    })
}

fn total_size_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^total size is\s+([\d,]+)").expect("static regex"))
}

fn parse_count(text: &str) -> u64 {
    text.replace(',', "").parse().unwrap_or(0)
}

/// Parse `-v` stdout.
///
/// Lines before the `sent ...` summary are candidate file names; the
/// summary closes the transferring state. Directory lines (trailing `/`)
/// and banners are skipped.
pub fn parse_stdout(stdout: &str) -> ParsedStdout {
    let mut parsed = ParsedStdout::default();
    let mut stats = TransferStats::default();
    let mut saw_summary = false;
    let mut transferring = true;

    for raw in stdout.lines() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = sent_line_regex().captures(line) {
            stats.sent_bytes = parse_count(&caps[1]);
            stats.received_bytes = parse_count(&caps[2]);
            stats.bytes_per_sec = caps[3].replace(',', "").parse().unwrap_or(0.0);
            saw_summary = true;
            transferring = false;
            continue;
        }
        if let Some(caps) = total_size_regex().captures(line) {
            stats.total_size = parse_count(&caps[1]);
            saw_summary = true;
            continue;
        }
        if !transferring || BANNER_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        if line.ends_with('/') {
            continue;
        }
        parsed.transferred.push(line.to_string());
    }

    if saw_summary {
        parsed.stats = Some(stats);
    }
    parsed
}

/// Paths named in `link_stat "<path>" failed` stderr lines.
pub fn parse_stderr(stderr: &str) -> Vec<PathBuf> {
    stderr
        .lines()
        .filter(|line| line.contains("link_stat") && line.contains("failed"))
        .filter_map(link_stat_path)
        .collect()
}

fn link_stat_path(line: &str) -> Option<PathBuf> {
    let after = &line[line.find("link_stat")? + "link_stat".len()..];
    let before_failed = &after[..after.find(" failed")?];
    let token = before_failed.trim().trim_matches('"');
    if token.is_empty() {
        None
    } else {
        Some(PathBuf::from(token))
    }
}
