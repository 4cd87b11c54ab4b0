//! Tilt-series tracking.
//!
//! Tilt images arrive one at a time and nothing in the stream says when a
//! series is finished unless an `.mdoc` announced its size. Without one, a
//! series is taken to be complete once it is at least as large as the
//! largest series seen so far, checked whenever acquisition visibly moves
//! on to a different series at a different angle.
//!
//! A series paused and resumed later can be reported complete too early;
//! the late tilts re-open it and it is reported again.

use crate::error::Result;
use crate::mdoc;
use crate::tilt::{TiltFormat, TiltInfo};
use crate::types::{AcquisitionGroup, GroupTable};
use acqsync_protocol::defaults::DATA_SUFFIXES;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct TomographyContext {
    format: TiltFormat,
    required_substrings: Vec<String>,
    series: GroupTable,
    /// Angles of each series' members, parallel to the member lists
    angles: HashMap<String, Vec<String>>,
    expected_sizes: HashMap<String, usize>,
    /// Series id and angle of the previous accepted tilt
    last_tilt: Option<(String, String)>,
}

impl TomographyContext {
    pub fn new(format: TiltFormat) -> Self {
        Self {
            format,
            required_substrings: Vec::new(),
            series: GroupTable::default(),
            angles: HashMap::new(),
            expected_sizes: HashMap::new(),
            last_tilt: None,
        }
    }

    /// Only accept data files whose lowercased name contains every substring.
    pub fn with_required_substrings(mut self, substrings: Vec<String>) -> Self {
        self.required_substrings = substrings.into_iter().map(|s| s.to_lowercase()).collect();
        self
    }

    pub fn format(&self) -> TiltFormat {
        self.format
    }

    /// Handle a transferred file; returns series that became complete.
    pub fn post_transfer(&mut self, path: &Path) -> Vec<String> {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Vec::new();
        };
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        if ext == "mdoc" {
            return match self.register_mdoc(path) {
                Ok(completed) => completed,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read mdoc");
                    Vec::new()
                }
            };
        }
        if name.contains("gain") || !DATA_SUFFIXES.contains(&ext) {
            return Vec::new();
        }
        let lower = name.to_lowercase();
        if !self.required_substrings.iter().all(|s| lower.contains(s.as_str())) {
            return Vec::new();
        }
        match self.format.parse(path) {
            Some(tilt) => self.add_tilt(path, &name, tilt),
            None => {
                debug!(path = %path.display(), "Tilt series and angle could not be determined");
                Vec::new()
            }
        }
    }

    fn add_tilt(&mut self, path: &Path, name: &str, tilt: TiltInfo) -> Vec<String> {
        let series_id = tilt.group_id(name);

        let (entry, created) = self.series.entry(&series_id);
        if created {
            info!(series = %series_id, "New tilt series found");
        }
        let angles = self.angles.entry(series_id.clone()).or_default();
        let is_new = !entry.members.iter().any(|m| m == path) && !angles.contains(&tilt.angle);
        if is_new {
            if entry.completed {
                warn!(
                    series = %series_id,
                    path = %path.display(),
                    "Tilt series was previously thought complete but a new tilt has arrived"
                );
                entry.completed = false;
            }
            entry.members.push(path.to_path_buf());
            angles.push(tilt.angle.clone());
        }

        let previous = self.last_tilt.replace((series_id.clone(), tilt.angle.clone()));
        let Some((last_series, last_angle)) = previous else {
            return Vec::new();
        };
        let moved_on = last_series != series_id && last_angle != tilt.angle;
        if moved_on || self.expected_size(&series_id).is_some() {
            self.check_completion(&series_id)
        } else {
            Vec::new()
        }
    }

    fn register_mdoc(&mut self, path: &Path) -> Result<Vec<String>> {
        let series_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let expected = mdoc::read_expected_size(path)?;
        info!(series = %series_id, expected, "Tilt series size announced");
        self.expected_sizes.insert(series_id.clone(), expected);
        Ok(self.check_completion(&series_id))
    }

    /// Size announced by an mdoc. Zero counts as unknown.
    pub fn expected_size(&self, series_id: &str) -> Option<usize> {
        self.expected_sizes.get(series_id).copied().filter(|n| *n > 0)
    }

    fn check_completion(&mut self, current: &str) -> Vec<String> {
        let largest = self.series.iter().map(|s| s.members.len()).max().unwrap_or(0);
        let expected = &self.expected_sizes;
        let threshold = |id: &str| {
            expected
                .get(id)
                .copied()
                .filter(|n| *n > 0)
                .unwrap_or(largest)
        };

        let mut newly_completed = Vec::new();
        // The series that triggered the check goes first, then the rest in
        // first-seen order.
        if let Some(entry) = self.series.get_mut(current) {
            if !entry.completed && !entry.members.is_empty() && entry.members.len() >= threshold(current) {
                entry.completed = true;
                newly_completed.push(entry.id.clone());
            }
        }
        for entry in self.series.iter_mut() {
            if !entry.completed && !entry.members.is_empty() && entry.members.len() >= threshold(&entry.id) {
                entry.completed = true;
                newly_completed.push(entry.id.clone());
            }
        }

        for id in &newly_completed {
            info!(series = %id, tilts = self.series.get(id).map_or(0, |s| s.members.len()), "Tilt series complete");
        }
        newly_completed
    }

    pub fn completed(&self) -> Vec<String> {
        self.series
            .iter()
            .filter(|s| s.completed)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn members(&self, series_id: &str) -> Vec<PathBuf> {
        self.series
            .get(series_id)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    pub fn groups(&self) -> Vec<AcquisitionGroup> {
        self.series.snapshot(|id| self.expected_size(id))
    }
}
