//! Atlas overview images.

use crate::types::{AcquisitionGroup, GroupTable};
use std::path::Path;
use tracing::info;

#[derive(Debug, Default)]
pub struct AtlasContext {
    atlases: GroupTable,
}

impl AtlasContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `Atlas_*.mrc` images under their directory. Atlases are
    /// single acquisitions with no completion signal of their own.
    pub fn post_transfer(&mut self, path: &Path) -> Vec<String> {
        let is_mrc = path.extension().map_or(false, |e| e == "mrc");
        let is_atlas = path
            .file_stem()
            .map_or(false, |s| s.to_string_lossy().contains("Atlas_"));
        if !is_mrc || !is_atlas {
            return Vec::new();
        }
        let dir = path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let (entry, _) = self.atlases.entry(&dir);
        if !entry.members.iter().any(|m| m == path) {
            info!(path = %path.display(), "Atlas image recorded");
            entry.members.push(path.to_path_buf());
        }
        Vec::new()
    }

    pub fn groups(&self) -> Vec<AcquisitionGroup> {
        self.atlases.snapshot(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_atlas_mrc_recorded() {
        let mut ctx = AtlasContext::new();
        ctx.post_transfer(Path::new("/d/atlas/Sample1/Atlas/Atlas_1.mrc"));
        ctx.post_transfer(Path::new("/d/atlas/Sample1/Atlas/Atlas_1.jpg"));
        ctx.post_transfer(Path::new("/d/atlas/Sample1/Atlas/Tile_1.mrc"));
        let groups = ctx.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ordered_members.len(), 1);
    }
}
