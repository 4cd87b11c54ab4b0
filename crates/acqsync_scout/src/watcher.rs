//! Polling directory watcher with optional settling
//!
//! Each scan walks the whole tree and compares `(size, max(mtime, ctime))`
//! per file against the previous scan. Files that are new or differ are
//! "changed". The snapshot is then replaced wholesale, so a file is only
//! reported again if it changes again.
//!
//! With a settling delay configured, changed files are parked as
//! [`WatchedFile`] candidates and only released once they have held the
//! same stat for the full delay. This keeps half-written movies from being
//! transferred while the detector is still writing frames.

use crate::error::{Result, ScoutError};
use crate::processor::{Processor, StageIo};
use crate::types::{FileBatch, FileStat, WatchedFile};
use acqsync_protocol::defaults::{
    DEFAULT_EXCLUDE_SUBSTRINGS, DEFAULT_POLL_INTERVAL_SECS, IN_PROGRESS_SUFFIX,
};
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Configuration for one watched root
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub root: PathBuf,
    /// Sleep between scans when running as a pipeline stage
    pub poll_interval: Duration,
    /// How long a file must hold a constant stat before release (None = release immediately)
    pub settling_delay: Option<Duration>,
    /// Whether to include dot-files and dot-directories
    pub include_hidden: bool,
    /// Paths containing any of these substrings are skipped
    pub exclude_substrings: Vec<String>,
}

impl WatchConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            settling_delay: None,
            include_hidden: false,
            exclude_substrings: DEFAULT_EXCLUDE_SUBSTRINGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_settling(mut self, delay: Duration) -> Self {
        self.settling_delay = Some(delay);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Polling watcher over a single root
pub struct FileWatcher {
    config: WatchConfig,
    name: String,
    snapshot: HashMap<PathBuf, FileStat>,
    pending: HashMap<PathBuf, WatchedFile>,
}

impl FileWatcher {
    pub fn new(config: WatchConfig) -> Self {
        let name = format!("watcher:{}", config.root.display());
        Self {
            config,
            name,
            snapshot: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Files currently waiting to settle
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Scan the tree and return files ready to hand downstream.
    pub fn scan(&mut self) -> Result<Vec<PathBuf>> {
        self.scan_at(Instant::now())
    }

    /// [`scan`](Self::scan) with an explicit clock, used by the settling logic.
    pub fn scan_at(&mut self, now: Instant) -> Result<Vec<PathBuf>> {
        let mut changed = self.detect_changes()?;
        match self.config.settling_delay {
            None => {
                sort_for_release(&mut changed);
                Ok(changed.into_iter().map(|f| f.path).collect())
            }
            Some(delay) => {
                self.stage(changed, now, delay);
                Ok(self.release_settled(now, |_| false))
            }
        }
    }

    /// Final scan on shutdown.
    ///
    /// Candidates pending from earlier scans whose live stat still matches
    /// their record are released without waiting for their deadline. Files
    /// the final scan found new or changed have never been seen stable and
    /// are left behind.
    pub fn flush(&mut self) -> Result<Vec<PathBuf>> {
        let now = Instant::now();
        let mut changed = self.detect_changes()?;
        let Some(delay) = self.config.settling_delay else {
            sort_for_release(&mut changed);
            return Ok(changed.into_iter().map(|f| f.path).collect());
        };

        let fresh: HashSet<PathBuf> = changed.iter().map(|f| f.path.clone()).collect();
        self.stage(changed, now, delay);
        let ready = self.release_settled(now, |f| !fresh.contains(&f.path));
        if !self.pending.is_empty() {
            debug!(left = self.pending.len(), "Unsettled candidates left behind on flush");
        }
        Ok(ready)
    }

    /// Walk the tree, replace the snapshot and return what differs from it.
    fn detect_changes(&mut self) -> Result<Vec<WatchedFile>> {
        let current = self.walk()?;
        let changed = current
            .iter()
            .filter(|(path, stat)| self.snapshot.get(*path) != Some(*stat))
            .map(|(path, stat)| WatchedFile {
                path: path.clone(),
                size: stat.size,
                modification_time: stat.modification_time,
                settling_deadline: None,
            })
            .collect();
        self.snapshot = current;
        Ok(changed)
    }

    fn stage(&mut self, changed: Vec<WatchedFile>, now: Instant, delay: Duration) {
        for mut file in changed {
            // A change restarts the clock, including for files already pending.
            file.settling_deadline = Some(now + delay);
            self.pending.insert(file.path.clone(), file);
        }
    }

    /// Re-stat candidates that are due (or `forced`) and release the ones
    /// that held still.
    fn release_settled(&mut self, now: Instant, forced: impl Fn(&WatchedFile) -> bool) -> Vec<PathBuf> {
        let due: Vec<PathBuf> = self
            .pending
            .values()
            .filter(|f| forced(f) || f.settling_deadline.map_or(true, |d| d <= now))
            .map(|f| f.path.clone())
            .collect();

        let mut ready = Vec::new();
        for path in due {
            let live = match fs::metadata(&path) {
                Ok(meta) => FileStat::from_metadata(&meta),
                Err(_) => {
                    debug!(path = %path.display(), "Candidate disappeared before settling");
                    self.pending.remove(&path);
                    continue;
                }
            };
            let Some(file) = self.pending.get_mut(&path) else {
                continue;
            };
            if live.size == file.size && live.modification_time <= file.modification_time {
                if let Some(file) = self.pending.remove(&path) {
                    ready.push(file);
                }
            } else {
                debug!(path = %path.display(), size = live.size, "Candidate still changing");
                file.size = live.size;
                file.modification_time = live.modification_time;
                if let Some(delay) = self.config.settling_delay {
                    file.settling_deadline = Some(now + delay);
                }
            }
        }

        sort_for_release(&mut ready);
        ready.into_iter().map(|f| f.path).collect()
    }

    fn walk(&self) -> Result<HashMap<PathBuf, FileStat>> {
        let root = &self.config.root;
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(ScoutError::NotADirectory(root.display().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ScoutError::RootMissing(root.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let include_hidden = self.config.include_hidden;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || include_hidden || !is_hidden(e.file_name()));

        let mut files = HashMap::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    // Subtrees moved away mid-walk are expected while the
                    // instrument reorganises its output.
                    let vanished = err
                        .io_error()
                        .map_or(false, |e| e.kind() == ErrorKind::NotFound);
                    if vanished {
                        debug!(error = %err, "Skipping vanished path");
                    } else {
                        warn!(error = %err, "Skipping unreadable path");
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() || self.is_excluded(entry.path()) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    files.insert(entry.path().to_path_buf(), FileStat::from_metadata(&meta));
                }
                Err(err) => {
                    debug!(path = %entry.path().display(), error = %err, "File vanished before stat");
                }
            }
        }
        Ok(files)
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if name.ends_with(IN_PROGRESS_SUFFIX) {
            return true;
        }
        let full = path.to_string_lossy();
        self.config
            .exclude_substrings
            .iter()
            .any(|pattern| full.contains(pattern.as_str()))
    }
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// `.mdoc` files go first so series sizes are known before their data
/// arrives; otherwise oldest first.
fn sort_for_release(files: &mut [WatchedFile]) {
    files.sort_by_key(|f| (!f.is_mdoc(), f.modification_time));
}

impl Processor for FileWatcher {
    type Input = ();
    type Output = FileBatch;
    type Error = ScoutError;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, io: &StageIo<(), FileBatch>) -> Result<()> {
        info!(
            root = %self.config.root.display(),
            poll_secs = self.config.poll_interval.as_secs_f64(),
            settling = ?self.config.settling_delay,
            "Watching directory"
        );

        while !io.cancel.is_cancelled() {
            let ready = self.scan()?;
            if !ready.is_empty() {
                info!(root = %self.config.root.display(), files = ready.len(), "New files found");
                io.output.put(FileBatch::new(ready));
            }
            if io.cancel.sleep(self.config.poll_interval) {
                break;
            }
        }

        let ready = self.flush()?;
        if !ready.is_empty() {
            info!(root = %self.config.root.display(), files = ready.len(), "Final flush");
            io.output.put(FileBatch::new(ready));
        }
        info!(root = %self.config.root.display(), "Watcher stopped");
        Ok(())
    }
}
