//! Single-particle movies, grouped by grid square.

use crate::types::{AcquisitionGroup, GroupTable};
use acqsync_protocol::defaults::DATA_SUFFIXES;
use std::path::Path;
use tracing::{debug, info};

/// Grid squares are open-ended: movies keep arriving while the microscope
/// revisits a square, so groups are tracked but never reported complete.
#[derive(Debug, Default)]
pub struct SpaContext {
    grid_squares: GroupTable,
}

/// `GridSquare_*` path component, or the parent directory.
pub fn grid_square_of(path: &Path) -> Option<String> {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .find(|c| c.starts_with("GridSquare"))
        .map(|c| c.into_owned())
        .or_else(|| {
            path.parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
        })
}

impl SpaContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_transfer(&mut self, path: &Path) -> Vec<String> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        if !DATA_SUFFIXES.contains(&ext) || name.contains("gain") {
            return Vec::new();
        }
        let Some(square) = grid_square_of(path) else {
            debug!(path = %path.display(), "No grid square for movie");
            return Vec::new();
        };

        let (entry, created) = self.grid_squares.entry(&square);
        if created {
            info!(grid_square = %square, "New grid square");
        }
        if !entry.members.iter().any(|m| m == path) {
            entry.members.push(path.to_path_buf());
        }
        Vec::new()
    }

    pub fn groups(&self) -> Vec<AcquisitionGroup> {
        self.grid_squares.snapshot(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movies_grouped_by_grid_square() {
        let mut ctx = SpaContext::new();
        ctx.post_transfer(Path::new("/d/Images-Disc1/GridSquare_7/Data/FoilHole_1_Data_2_3_Fractions.tiff"));
        ctx.post_transfer(Path::new("/d/Images-Disc1/GridSquare_8/Data/FoilHole_4_Data_5_6_Fractions.tiff"));
        ctx.post_transfer(Path::new("/d/Images-Disc1/GridSquare_7/Data/FoilHole_9_Data_2_3_Fractions.tiff"));
        ctx.post_transfer(Path::new("/d/Images-Disc1/GridSquare_7/Data/FoilHole_9_Data_2_3.xml"));

        let groups = ctx.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id, "GridSquare_7");
        assert_eq!(groups[0].ordered_members.len(), 2);
        assert!(!groups[0].is_completed());
    }

    #[test]
    fn test_parent_directory_fallback() {
        assert_eq!(
            grid_square_of(Path::new("/d/session/FoilHole_1_Fractions.tiff")).as_deref(),
            Some("session")
        );
    }
}
