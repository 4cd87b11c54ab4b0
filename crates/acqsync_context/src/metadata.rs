//! Session metadata trees (EPU `Metadata/`, Tomo `Batch/`, `SearchMaps/`).
//!
//! These files describe an acquisition rather than belong to one, so no
//! groups are formed. The context only keeps count of what went past.

use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default)]
pub struct MetadataContext {
    files: Vec<PathBuf>,
}

impl MetadataContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_transfer(&mut self, path: &Path) -> Vec<String> {
        debug!(path = %path.display(), "Metadata file transferred");
        self.files.push(path.to_path_buf());
        Vec::new()
    }

    pub fn files_seen(&self) -> usize {
        self.files.len()
    }
}
