//! Transfer pipe
//!
//! Consumes [`FileBatch`]es, copies each group of files with a [`CopyTool`]
//! and turns the tool's report into per-file outcomes. Transferred files are
//! registered through a [`Registrar`] and their source paths forwarded
//! downstream; failed files are resubmitted on the pipe's own input queue
//! while the [`RetryPolicy`] allows it.

use crate::error::{CopyFailure, TransferError};
use crate::metrics::METRICS;
use crate::rsync::{parse_stderr, parse_stdout, CopyOutput, CopyRequest, CopyTool, TransferStats};
use acqsync_protocol::defaults::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};
use acqsync_protocol::TransferProgress;
use acqsync_scout::{FileBatch, Processor, StageIo};
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Maps `(relative parent, source file)` to `(destination subpath, file name)`.
///
/// When set, every file is copied in its own invocation so it can be renamed.
pub type StructureFn = Arc<dyn Fn(&Path, &Path) -> (PathBuf, String) + Send + Sync>;

type ReportObserver = Box<dyn FnMut(&CopyReport) + Send>;

/// Called once per transferred file with its destination path.
pub trait Registrar: Send {
    fn register(&mut self, destination: &Path);
}

impl<F> Registrar for F
where
    F: FnMut(&Path) + Send,
{
    fn register(&mut self, destination: &Path) {
        self(destination)
    }
}

// ============================================================================
// Policy and outcomes
// ============================================================================

/// Bounded retry: a file is copied at most `max_attempts` times, with
/// `delay` between a failure and its resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// Single attempt, failures are final.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Whether a file that failed on `attempt` (0-based) gets another go.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// Confirmed by the tool; `bytes` is the source size
    Transferred { bytes: u64 },
    /// Already up to date at the destination
    Unchanged,
    Failed { reason: CopyFailure },
}

impl TransferOutcome {
    pub fn is_transferred(&self) -> bool {
        matches!(self, TransferOutcome::Transferred { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TransferOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub outcome: TransferOutcome,
}

/// Structured result of one copy invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyReport {
    pub destination: PathBuf,
    /// `None` when the tool could not be launched or died by signal
    pub exit_code: Option<i32>,
    pub failure: Option<CopyFailure>,
    /// In request order
    pub files: Vec<FileOutcome>,
    pub stats: Option<TransferStats>,
    pub attempt: u32,
}

/// Files of one batch that share a destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub source_root: PathBuf,
    pub relative_structure: PathBuf,
    pub files: Vec<PathBuf>,
    pub attempt_count: u32,
    /// Set for single-file units produced by a [`StructureFn`]
    pub rename_to: Option<String>,
}

/// What happened to one batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Source paths, in tool order
    pub transferred: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    /// Failed files that will be copied again
    pub retry: Option<FileBatch>,
    /// Failed files that will not be copied again
    pub exhausted: Vec<PathBuf>,
    pub reports: Vec<CopyReport>,
}

// ============================================================================
// Ledger
// ============================================================================

#[derive(Debug, Default)]
struct LedgerInner {
    failed_history: Vec<PathBuf>,
    exhausted: Vec<PathBuf>,
    transferred: u64,
    failed: u64,
    unchanged: u64,
    retried: u64,
    stats: TransferStats,
    last_exit_code: Option<i32>,
}

/// Shared view of a pipe's history, for operators and progress reports.
#[derive(Debug, Clone, Default)]
pub struct TransferLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every file that failed at least once, including ones that later succeeded.
    pub fn failed_history(&self) -> Vec<PathBuf> {
        self.lock().failed_history.clone()
    }

    pub fn exhausted(&self) -> Vec<PathBuf> {
        self.lock().exhausted.clone()
    }

    pub fn transferred_count(&self) -> u64 {
        self.lock().transferred
    }

    pub fn failed_count(&self) -> u64 {
        self.lock().failed
    }

    pub fn unchanged_count(&self) -> u64 {
        self.lock().unchanged
    }

    pub fn retried_count(&self) -> u64 {
        self.lock().retried
    }

    pub fn stats(&self) -> TransferStats {
        self.lock().stats.clone()
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.lock().last_exit_code
    }

    pub fn progress(&self, source: &str) -> TransferProgress {
        let inner = self.lock();
        TransferProgress {
            source: source.to_string(),
            files_transferred: inner.transferred,
            files_failed: inner.failed,
            files_retried: inner.retried,
            bytes_sent: inner.stats.sent_bytes,
            bytes_received: inner.stats.received_bytes,
            bytes_per_sec: inner.stats.bytes_per_sec,
            total_size: inner.stats.total_size,
            last_exit_code: inner.last_exit_code,
        }
    }

    fn record_report(&self, report: &CopyReport) {
        let mut inner = self.lock();
        if let Some(stats) = &report.stats {
            inner.stats.accumulate(stats);
        }
        if report.exit_code.is_some() {
            inner.last_exit_code = report.exit_code;
        }
        for file in &report.files {
            match file.outcome {
                TransferOutcome::Transferred { .. } => inner.transferred += 1,
                TransferOutcome::Unchanged => inner.unchanged += 1,
                TransferOutcome::Failed { .. } => {
                    inner.failed += 1;
                    inner.failed_history.push(file.source.clone());
                }
            }
        }
    }

    fn record_rejected(&self, path: &Path) {
        let mut inner = self.lock();
        inner.failed += 1;
        inner.failed_history.push(path.to_path_buf());
    }

    fn record_retry(&self, count: usize) {
        self.lock().retried += count as u64;
    }

    fn record_exhausted(&self, paths: &[PathBuf]) {
        self.lock().exhausted.extend_from_slice(paths);
    }
}

// ============================================================================
// TransferPipe
// ============================================================================

pub struct TransferPipe {
    name: String,
    root: PathBuf,
    destination: PathBuf,
    tool: Box<dyn CopyTool>,
    structure: Option<StructureFn>,
    registrar: Option<Box<dyn Registrar>>,
    retry: RetryPolicy,
    ledger: TransferLedger,
    observer: Option<ReportObserver>,
}

impl TransferPipe {
    /// Copy files under `root` to the same relative location under `destination`.
    pub fn new(root: impl Into<PathBuf>, destination: impl Into<PathBuf>, tool: impl CopyTool + 'static) -> Self {
        let root = root.into();
        Self {
            name: format!("transfer:{}", root.display()),
            root,
            destination: destination.into(),
            tool: Box::new(tool),
            structure: None,
            registrar: None,
            retry: RetryPolicy::default(),
            ledger: TransferLedger::new(),
            observer: None,
        }
    }

    pub fn with_structure(mut self, structure: StructureFn) -> Self {
        self.structure = Some(structure);
        self
    }

    pub fn with_registrar(mut self, registrar: impl Registrar + 'static) -> Self {
        self.registrar = Some(Box::new(registrar));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: impl FnMut(&CopyReport) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn ledger(&self) -> TransferLedger {
        self.ledger.clone()
    }

    /// Split a batch into copy units. Files outside the root are returned separately.
    pub fn plan(&self, batch: &FileBatch) -> (Vec<TransferUnit>, Vec<PathBuf>) {
        let mut units: Vec<TransferUnit> = Vec::new();
        let mut by_parent: HashMap<PathBuf, usize> = HashMap::new();
        let mut rejected = Vec::new();

        for file in &batch.files {
            let relative = match file.strip_prefix(&self.root) {
                Ok(rel) if rel.file_name().is_some() => rel,
                _ => {
                    rejected.push(file.clone());
                    continue;
                }
            };
            let parent = relative.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

            if let Some(structure) = &self.structure {
                let (subpath, name) = structure(&parent, file);
                units.push(TransferUnit {
                    source_root: self.root.clone(),
                    relative_structure: subpath,
                    files: vec![file.clone()],
                    attempt_count: batch.attempt,
                    rename_to: Some(name),
                });
                continue;
            }

            match by_parent.get(&parent) {
                Some(&idx) => units[idx].files.push(file.clone()),
                None => {
                    by_parent.insert(parent.clone(), units.len());
                    units.push(TransferUnit {
                        source_root: self.root.clone(),
                        relative_structure: parent,
                        files: vec![file.clone()],
                        attempt_count: batch.attempt,
                        rename_to: None,
                    });
                }
            }
        }
        (units, rejected)
    }

    /// Copy one batch, register transferred files and work out what to retry.
    pub fn process_batch(&mut self, batch: &FileBatch) -> BatchResult {
        METRICS.inc_batches_received();
        let mut result = BatchResult::default();
        let mut retry_files = Vec::new();

        let (units, rejected) = self.plan(batch);
        for path in rejected {
            warn!(path = %path.display(), root = %self.root.display(), "File outside watched root, not transferring");
            METRICS.inc_files_failed();
            self.ledger.record_rejected(&path);
            result.failed.push(path.clone());
            result.exhausted.push(path);
        }

        for unit in &units {
            let report = self.copy_unit(unit);
            for file in &report.files {
                match &file.outcome {
                    TransferOutcome::Transferred { .. } => {
                        METRICS.inc_files_transferred();
                        if let Some(registrar) = self.registrar.as_mut() {
                            registrar.register(&file.destination);
                        }
                        result.transferred.push(file.source.clone());
                    }
                    TransferOutcome::Unchanged => {
                        METRICS.inc_files_unchanged();
                        debug!(path = %file.source.display(), "Destination already up to date");
                    }
                    TransferOutcome::Failed { reason } => {
                        METRICS.inc_files_failed();
                        result.failed.push(file.source.clone());
                        if reason.is_transient() && self.retry.allows_retry_after(batch.attempt) {
                            retry_files.push(file.source.clone());
                        } else {
                            warn!(
                                path = %file.source.display(),
                                attempt = batch.attempt,
                                reason = %reason,
                                "File permanently failed"
                            );
                            result.exhausted.push(file.source.clone());
                        }
                    }
                }
            }

            self.ledger.record_report(&report);
            if let Some(observer) = self.observer.as_mut() {
                observer(&report);
            }
            result.reports.push(report);
        }

        if !result.exhausted.is_empty() {
            METRICS.add_files_exhausted(result.exhausted.len() as u64);
            self.ledger.record_exhausted(&result.exhausted);
        }
        if !retry_files.is_empty() {
            info!(
                files = retry_files.len(),
                next_attempt = batch.attempt + 1,
                max_attempts = self.retry.max_attempts,
                "Resubmitting failed files"
            );
            METRICS.add_files_retried(retry_files.len() as u64);
            self.ledger.record_retry(retry_files.len());
            result.retry = Some(FileBatch::retry_of(retry_files, batch.attempt));
        }
        result
    }

    fn copy_unit(&mut self, unit: &TransferUnit) -> CopyReport {
        let destination = self.destination.join(&unit.relative_structure);
        let request = CopyRequest {
            sources: &unit.files,
            destination_dir: &destination,
            rename_to: unit.rename_to.as_deref(),
        };

        let start = Instant::now();
        METRICS.inc_copy_invocations();
        let copied = self.tool.copy(&request);
        METRICS.record_copy_time(start);

        let report = match copied {
            Ok(output) => build_report(unit, &destination, &output),
            Err(e) => {
                warn!(destination = %destination.display(), error = %e, "Copy tool failed to run");
                spawn_failure_report(unit, &destination, &e)
            }
        };

        if let Some(stats) = &report.stats {
            METRICS.add_bytes(stats.sent_bytes, stats.received_bytes);
        }
        let transferred = report.files.iter().filter(|f| f.outcome.is_transferred()).count();
        let failed = report.files.iter().filter(|f| f.outcome.is_failed()).count();
        info!(
            destination = %destination.display(),
            files = unit.files.len(),
            transferred,
            failed,
            exit_code = ?report.exit_code,
            attempt = unit.attempt_count,
            "Copy finished"
        );
        report
    }
}

fn destination_for(unit: &TransferUnit, destination: &Path, source: &Path) -> PathBuf {
    match &unit.rename_to {
        Some(name) => destination.join(name),
        None => destination.join(source.file_name().unwrap_or_else(|| OsStr::new(""))),
    }
}

fn build_report(unit: &TransferUnit, destination: &Path, output: &CopyOutput) -> CopyReport {
    let parsed = parse_stdout(&output.stdout);
    let listed: HashSet<&str> = parsed.transferred.iter().map(String::as_str).collect();
    let vanished = parse_stderr(&output.stderr);

    let failure = match output.exit_code {
        Some(0) => None,
        Some(code) => Some(CopyFailure::from_exit_code(code, &output.stderr)),
        None => Some(CopyFailure::from_signal(&output.stderr)),
    };

    let files = unit
        .files
        .iter()
        .map(|source| {
            let name = source.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            let confirmed = listed.contains(name.as_ref())
                || listed.iter().any(|line| line.ends_with(&format!("/{}", name)))
                || unit.rename_to.as_deref().map_or(false, |r| listed.contains(r));

            let outcome = if confirmed {
                TransferOutcome::Transferred {
                    bytes: std::fs::metadata(source).map(|m| m.len()).unwrap_or(0),
                }
            } else if vanished
                .iter()
                .any(|p| p == source || p.file_name() == source.file_name())
            {
                TransferOutcome::Failed {
                    reason: CopyFailure::Transient {
                        message: format!("Source missing at copy time: {}", source.display()),
                    },
                }
            } else if let Some(reason) = &failure {
                TransferOutcome::Failed {
                    reason: reason.clone(),
                }
            } else {
                TransferOutcome::Unchanged
            };

            FileOutcome {
                source: source.clone(),
                destination: destination_for(unit, destination, source),
                outcome,
            }
        })
        .collect();

    CopyReport {
        destination: destination.to_path_buf(),
        exit_code: output.exit_code,
        failure,
        files,
        stats: parsed.stats,
        attempt: unit.attempt_count,
    }
}

fn spawn_failure_report(unit: &TransferUnit, destination: &Path, error: &TransferError) -> CopyReport {
    let reason = CopyFailure::Transient {
        message: error.to_string(),
    };
    CopyReport {
        destination: destination.to_path_buf(),
        exit_code: None,
        failure: Some(reason.clone()),
        files: unit
            .files
            .iter()
            .map(|source| FileOutcome {
                source: source.clone(),
                destination: destination_for(unit, destination, source),
                outcome: TransferOutcome::Failed {
                    reason: reason.clone(),
                },
            })
            .collect(),
        stats: None,
        attempt: unit.attempt_count,
    }
}

impl Processor for TransferPipe {
    type Input = FileBatch;
    type Output = PathBuf;
    type Error = TransferError;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, io: &StageIo<FileBatch, PathBuf>) -> Result<(), TransferError> {
        // Retry batches put back on the input that have not been taken yet.
        let mut outstanding_retries = 0usize;

        loop {
            let batch = match io.input.get() {
                Some(batch) => batch,
                None if outstanding_retries > 0 => {
                    // Retries landed behind the end marker; re-close so they
                    // are processed before stopping.
                    debug!(outstanding_retries, "Input closed with retries pending");
                    io.input.close();
                    continue;
                }
                None => break,
            };

            if batch.attempt > 0 {
                outstanding_retries = outstanding_retries.saturating_sub(1);
            }
            if batch.is_empty() {
                continue;
            }

            let result = self.process_batch(&batch);
            for source in result.transferred {
                io.output.put(source);
            }
            if let Some(retry) = result.retry {
                // Cancellation cuts the wait short.
                if !self.retry.delay.is_zero() && io.cancel.sleep(self.retry.delay) {
                    debug!(files = retry.len(), "Retry delay cut short by cancellation");
                }
                outstanding_retries += 1;
                io.input.put(retry);
            }
        }
        Ok(())
    }
}
