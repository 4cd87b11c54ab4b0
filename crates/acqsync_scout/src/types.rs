//! Core data types for Scout

use std::fs::Metadata;
use std::path::PathBuf;
use std::time::{Instant, UNIX_EPOCH};

/// A batch of paths travelling between stages.
///
/// `attempt` counts how many times these files have already been handed to
/// a transfer; fresh batches from a watcher start at 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileBatch {
    pub files: Vec<PathBuf>,
    pub attempt: u32,
}

impl FileBatch {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files, attempt: 0 }
    }

    /// Batch for files that failed during attempt `previous`.
    pub fn retry_of(files: Vec<PathBuf>, previous: u32) -> Self {
        Self {
            files,
            attempt: previous + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Size and change time of a file as seen by one poll.
///
/// `modification_time` is `max(mtime, ctime)` in milliseconds since the
/// epoch, so permission and rename changes also count as changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modification_time: i64,
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let modification_time = {
            use std::os::unix::fs::MetadataExt;
            let ctime = meta.ctime() * 1000 + meta.ctime_nsec() / 1_000_000;
            mtime.max(ctime)
        };
        #[cfg(not(unix))]
        let modification_time = mtime;

        Self {
            size: meta.len(),
            modification_time,
        }
    }
}

/// A file waiting to settle before it is handed downstream.
#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub size: u64,
    pub modification_time: i64,
    pub settling_deadline: Option<Instant>,
}

impl WatchedFile {
    pub fn is_mdoc(&self) -> bool {
        self.path.extension().map_or(false, |ext| ext == "mdoc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_batch_increments_attempt() {
        let batch = FileBatch::new(vec![PathBuf::from("/data/a.tiff")]);
        assert_eq!(batch.attempt, 0);
        let retry = FileBatch::retry_of(batch.files.clone(), batch.attempt);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.len(), 1);
    }

    #[test]
    fn test_watched_file_mdoc_detection() {
        let file = WatchedFile {
            path: PathBuf::from("/data/Position_1.mdoc"),
            size: 10,
            modification_time: 0,
            settling_deadline: None,
        };
        assert!(file.is_mdoc());
    }
}
