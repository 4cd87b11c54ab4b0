//! Acqsync Worker - file transfer to the remote store
//!
//! The worker consumes batches from a watcher, copies them to the
//! destination with an external tool (rsync in production), and turns the
//! tool's text output plus exit status into per-file outcomes.
//!
//! # Outcome rules
//!
//! - A file the tool lists on stdout is transferred, whatever the exit code.
//! - A file named in a `link_stat ... failed` stderr line is failed.
//! - Any other file is failed when the exit code is non-zero, and
//!   unchanged (already up to date) when it is zero.
//!
//! Failed files are resubmitted under a bounded [`RetryPolicy`].

pub mod error;
pub mod metrics;
pub mod rsync;
pub mod transfer;

pub use error::{CopyFailure, Result, TransferError};
pub use metrics::{MetricsSnapshot, METRICS};
pub use rsync::{CopyOutput, CopyRequest, CopyTool, RsyncTool, TransferStats};
pub use transfer::{
    BatchResult, CopyReport, FileOutcome, Registrar, RetryPolicy, StructureFn, TransferLedger,
    TransferOutcome, TransferPipe, TransferUnit,
};
