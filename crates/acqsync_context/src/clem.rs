//! Leica light-microscopy exports.
//!
//! Autosave writes one TIFF per frame and channel
//! (`<series>--Z<nn>--C<nn>.tif`) plus a `Metadata/<series>.xlif` that
//! describes how many there will be. A series is complete when the TIFF
//! count reaches the channel count times the frame count. Whole `.lif`
//! containers are complete on arrival.

use crate::error::{ContextError, Result};
use crate::types::{AcquisitionGroup, GroupTable};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct ClemContext {
    series: GroupTable,
    expected: HashMap<String, usize>,
}

/// Last two components of `dir` joined with the series name.
fn series_key(dir: Option<&Path>, name: &str) -> String {
    let mut parts: Vec<String> = dir
        .map(|d| {
            d.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .filter(|c| c != "/")
                .collect()
        })
        .unwrap_or_default();
    let keep = parts.len().saturating_sub(2);
    parts.drain(..keep);
    parts.push(name.to_string());
    parts.join("/")
}

fn channel_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<ChannelDescription[\s/>]").expect("static regex"))
}

fn dimension_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<DimensionDescription\b[^>]*>").expect("static regex"))
}

fn elements_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"NumberOfElements="(\d+)""#).expect("static regex"))
}

/// Channels times frames, where frames is the third dimension's
/// `NumberOfElements` (1 for 2D images).
pub fn expected_files(xlif: &str) -> Result<usize> {
    let channels = channel_regex().find_iter(xlif).count();
    let frames = match dimension_regex().find_iter(xlif).nth(2) {
        Some(dim) => elements_regex()
            .captures(dim.as_str())
            .and_then(|c| c[1].parse::<usize>().ok())
            .ok_or_else(|| ContextError::MalformedMetadata {
                path: String::from("<xlif>"),
                reason: "third dimension has no NumberOfElements".to_string(),
            })?,
        None => 1,
    };
    Ok(channels * frames)
}

impl ClemContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_transfer(&mut self, path: &Path) -> Vec<String> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let key = match ext {
            "lif" => return self.add_container(path, &stem),
            "tif" | "tiff" => {
                let fields: Vec<&str> = stem.split("--").collect();
                if fields.len() != 3 {
                    warn!(path = %path.display(), "TIFF is likely not part of the CLEM workflow");
                    return Vec::new();
                }
                let key = series_key(path.parent(), fields[0]);
                let (entry, created) = self.series.entry(&key);
                if created {
                    info!(series = %key, "New CLEM series");
                }
                if !entry.members.iter().any(|m| m == path) {
                    entry.members.push(path.to_path_buf());
                }
                key
            }
            "xlif" => {
                // Metadata/<series>.xlif sits one level below the TIFFs.
                let key = series_key(path.parent().and_then(Path::parent), &stem);
                match std::fs::read_to_string(path)
                    .map_err(ContextError::from)
                    .and_then(|text| expected_files(&text))
                {
                    Ok(count) => {
                        info!(series = %key, expected = count, "CLEM series size announced");
                        self.expected.insert(key.clone(), count);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to read xlif metadata");
                        return Vec::new();
                    }
                }
                key
            }
            _ => return Vec::new(),
        };
        self.check(&key)
    }

    fn add_container(&mut self, path: &Path, stem: &str) -> Vec<String> {
        let key = series_key(path.parent(), stem);
        let (entry, created) = self.series.entry(&key);
        if !created {
            return Vec::new();
        }
        entry.members.push(path.to_path_buf());
        entry.completed = true;
        info!(series = %key, "LIF container received");
        vec![key]
    }

    fn check(&mut self, key: &str) -> Vec<String> {
        let Some(&expected) = self.expected.get(key) else {
            return Vec::new();
        };
        let Some(entry) = self.series.get_mut(key) else {
            return Vec::new();
        };
        if entry.members.len() > expected && entry.completed {
            warn!(series = %key, files = entry.members.len(), expected, "More TIFFs than announced");
            return Vec::new();
        }
        if !entry.completed && expected > 0 && entry.members.len() >= expected {
            entry.completed = true;
            info!(series = %key, files = entry.members.len(), "CLEM series complete");
            return vec![key.to_string()];
        }
        Vec::new()
    }

    pub fn groups(&self) -> Vec<AcquisitionGroup> {
        self.series.snapshot(|id| self.expected.get(id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XLIF: &str = r#"<LMSDataContainerHeader>
  <Element Name="Position 1">
    <Data><Image><ImageDescription>
      <Channels>
        <ChannelDescription DataType="0" ChannelTag="0" />
        <ChannelDescription DataType="0" ChannelTag="1" />
      </Channels>
      <Dimensions>
        <DimensionDescription DimID="1" NumberOfElements="2048" />
        <DimensionDescription DimID="2" NumberOfElements="2048" />
        <DimensionDescription DimID="3" NumberOfElements="3" />
      </Dimensions>
    </ImageDescription></Image></Data>
  </Element>
</LMSDataContainerHeader>"#;

    #[test]
    fn test_expected_files_from_xlif() {
        assert_eq!(expected_files(XLIF).unwrap(), 6);
        let flat = XLIF.replace(r#"<DimensionDescription DimID="3" NumberOfElements="3" />"#, "");
        assert_eq!(expected_files(&flat).unwrap(), 2);
    }

    #[test]
    fn test_series_key() {
        assert_eq!(
            series_key(Some(Path::new("/data/session/grid1")), "Position 1"),
            "session/grid1/Position 1"
        );
        assert_eq!(series_key(Some(Path::new("/x")), "P"), "x/P");
    }

    #[test]
    fn test_lif_complete_on_arrival() {
        let mut ctx = ClemContext::new();
        assert_eq!(
            ctx.post_transfer(Path::new("/data/session/grid1/Sample.lif")),
            vec!["session/grid1/Sample"]
        );
        assert!(ctx.post_transfer(Path::new("/data/session/grid1/Sample.lif")).is_empty());
    }

    #[test]
    fn test_unrelated_tiff_ignored() {
        let mut ctx = ClemContext::new();
        assert!(ctx.post_transfer(Path::new("/data/grid1/overview.tif")).is_empty());
        assert!(ctx.groups().is_empty());
    }
}
