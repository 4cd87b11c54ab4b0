//! FIB milling images, grouped by lamella and ordered by capture time.
//!
//! AutoTEM writes `Sites/Lamella (N)/DCImages/.../YYYY-MM-DD-hh-mm-ss-*.png`;
//! a bare `Lamella` directory is lamella 1.

use crate::types::{AcquisitionGroup, GroupState};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct FibContext {
    /// Lamella number -> (capture time, image) sorted by time
    lamellae: BTreeMap<u32, Vec<(NaiveDateTime, PathBuf)>>,
}

pub fn lamella_number(path: &Path) -> Option<u32> {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let sites = parts.iter().position(|p| p == "Sites")?;
    let name = parts.get(sites + 1)?;
    let digits = name.trim().replace("Lamella", "").replace(['(', ')'], "");
    let digits = digits.trim();
    if digits.is_empty() {
        Some(1)
    } else {
        digits.parse().ok()
    }
}

/// Capture time from the first six `-` separated fields of the name.
pub fn capture_time(path: &Path) -> Option<NaiveDateTime> {
    let name = path.file_name()?.to_str()?;
    let fields: Vec<&str> = name.split('-').take(6).collect();
    if fields.len() < 6 {
        return None;
    }
    NaiveDateTime::parse_from_str(&fields.join("-"), "%Y-%m-%d-%H-%M-%S").ok()
}

impl FibContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_transfer(&mut self, path: &Path) -> Vec<String> {
        let is_png = path.extension().map_or(false, |e| e == "png");
        let in_dc_images = path.components().any(|c| c.as_os_str() == "DCImages");
        if !is_png || !in_dc_images {
            return Vec::new();
        }
        let (Some(lamella), Some(taken)) = (lamella_number(path), capture_time(path)) else {
            debug!(path = %path.display(), "Milling image name not understood");
            return Vec::new();
        };

        let images = self.lamellae.entry(lamella).or_insert_with(|| {
            info!(lamella, "New lamella");
            Vec::new()
        });
        if images.iter().any(|(_, p)| p == path) {
            return Vec::new();
        }
        let at = images.partition_point(|(t, _)| *t <= taken);
        images.insert(at, (taken, path.to_path_buf()));
        Vec::new()
    }

    pub fn groups(&self) -> Vec<AcquisitionGroup> {
        self.lamellae
            .iter()
            .map(|(number, images)| AcquisitionGroup {
                group_id: format!("Lamella_{}", number),
                ordered_members: images.iter().map(|(_, p)| p.clone()).collect(),
                state: GroupState::Active,
                expected_size: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lamella_number() {
        assert_eq!(lamella_number(Path::new("/d/Sites/Lamella (3)/DCImages/a.png")), Some(3));
        assert_eq!(lamella_number(Path::new("/d/Sites/Lamella/DCImages/a.png")), Some(1));
        assert_eq!(lamella_number(Path::new("/d/DCImages/a.png")), None);
    }

    #[test]
    fn test_images_ordered_by_capture_time() {
        let mut ctx = FibContext::new();
        let late = Path::new("/d/Sites/Lamella (2)/DCImages/DCM/2024-01-15-10-31-00-2.png");
        let early = Path::new("/d/Sites/Lamella (2)/DCImages/DCM/2024-01-15-10-30-00-1.png");
        ctx.post_transfer(late);
        ctx.post_transfer(early);
        ctx.post_transfer(Path::new("/d/Sites/Lamella (2)/DCImages/DCM/notes.png"));

        let groups = ctx.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "Lamella_2");
        assert_eq!(groups[0].ordered_members, vec![early.to_path_buf(), late.to_path_buf()]);
    }
}
