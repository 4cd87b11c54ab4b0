//! Acqsync Scout - file discovery and stage plumbing
//!
//! Scout watches instrument output directories and hands batches of
//! ready files to the rest of the agent. It also owns the stage
//! abstraction every agent component runs on:
//!
//! - [`processor`]: queues, the [`Processor`] trait and the [`Pipeline`] builder
//! - [`watcher`]: polling [`FileWatcher`] with optional settling
//!
//! Polling is used instead of inotify because acquisition PCs commonly
//! export their data over SMB, where change notifications are unreliable.

pub mod cancel;
pub mod error;
pub mod processor;
pub mod types;
pub mod watcher;

pub use cancel::CancellationToken;
pub use error::{Result, ScoutError};
pub use processor::{Pipeline, Processor, Queue, Received, RunningPipeline, StageIo};
pub use types::{FileBatch, FileStat, WatchedFile};
pub use watcher::{FileWatcher, WatchConfig};
