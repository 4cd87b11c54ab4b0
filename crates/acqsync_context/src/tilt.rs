//! Tilt-series filename conventions.
//!
//! Each acquisition software (and Tomo version) encodes the series number,
//! the tilt angle and an optional tag differently:
//!
//! | Format   | Example                                   | tag        | series | angle |
//! |----------|-------------------------------------------|------------|--------|-------|
//! | Tomo 5.7 | `Position_1_[30.0]_fractions.tiff`        | `Position` | `1`    | `30.0`|
//! | Tomo 5.11| `Position12_001_30.00.tiff`               | `Position` | `12`   | `30.00`|
//! | Tomo 5.12| `Position_3_2_001_30.00_fractions.tiff`   | `Position_3`| `2`   | `30.00`|
//! | SerialEM | `tilt_5_001_-30.0.tif`                    |            | `5`    | `-30.0`|

use crate::error::{ContextError, Result};
use std::path::Path;

/// Tag, series and angle as written in a filename.
#[derive(Debug, Clone, PartialEq)]
pub struct TiltInfo {
    pub tag: String,
    pub series: String,
    pub angle: String,
}

impl TiltInfo {
    /// `tag_series` when the name spells it that way, else `tag` + `series`.
    pub fn group_id(&self, file_name: &str) -> String {
        if self.tag.is_empty() {
            return self.series.clone();
        }
        let joined = format!("{}_{}", self.tag, self.series);
        if file_name.contains(&joined) {
            joined
        } else {
            format!("{}{}", self.tag, self.series)
        }
    }

    fn is_numeric(&self) -> bool {
        self.series.parse::<f64>().is_ok() && self.angle.parse::<f64>().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TiltFormat {
    Tomo5_7,
    Tomo5_11,
    Tomo5_12,
    SerialEm,
}

/// Known Tomo versions and the conventions they use
const TOMO_VERSIONS: &[(&str, TiltFormat)] = &[
    ("5.7", TiltFormat::Tomo5_7),
    ("5.11", TiltFormat::Tomo5_11),
    ("5.12", TiltFormat::Tomo5_12),
];

impl TiltFormat {
    /// Resolve from the configured software name and Tomo version.
    pub fn for_software(software: &str, tomo_version: &str) -> Result<Self> {
        match software.to_ascii_lowercase().as_str() {
            "serialem" => Ok(TiltFormat::SerialEm),
            "tomo" => TOMO_VERSIONS
                .iter()
                .find(|(version, _)| *version == tomo_version)
                .map(|(_, format)| *format)
                .ok_or_else(|| ContextError::UnknownTomoVersion(tomo_version.to_string())),
            other => Err(ContextError::UnknownSoftware(other.to_string())),
        }
    }

    /// Parse a data file name. `None` when the name does not follow the
    /// convention or series/angle are not numbers.
    pub fn parse(&self, path: &Path) -> Option<TiltInfo> {
        let name = path.file_name()?.to_str()?;
        let info = match self {
            TiltFormat::Tomo5_7 => parse_v5_7(name),
            TiltFormat::Tomo5_11 => parse_v5_11(name),
            TiltFormat::Tomo5_12 => parse_v5_12(name),
            TiltFormat::SerialEm => parse_serialem(name),
        }?;
        info.is_numeric().then_some(info)
    }
}

fn strip_extension(token: &str) -> String {
    let parts: Vec<&str> = token.split('.').collect();
    parts[..parts.len().saturating_sub(1)].join(".")
}

fn parse_v5_7(name: &str) -> Option<TiltInfo> {
    let tokens: Vec<&str> = name.split('_').collect();
    let angle = name.split('[').nth(1)?.split(']').next()?;
    Some(TiltInfo {
        tag: tokens[0].to_string(),
        series: tokens.get(1)?.to_string(),
        angle: angle.to_string(),
    })
}

fn parse_v5_11(name: &str) -> Option<TiltInfo> {
    let tokens: Vec<&str> = name.split('_').collect();
    let head = tokens[0];
    // The series number is glued to the end of the tag.
    let digits = head.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 || digits == head.chars().count() {
        return None;
    }
    let split = head.len() - digits;
    Some(TiltInfo {
        tag: head[..split].to_string(),
        series: head[split..].to_string(),
        angle: strip_extension(tokens.get(2)?),
    })
}

fn parse_v5_12(name: &str) -> Option<TiltInfo> {
    let tokens: Vec<&str> = name.split('_').collect();
    let angle_idx = tokens.iter().position(|t| t.contains('.')).unwrap_or(0);
    let numbered = angle_idx >= 2
        && !tokens[angle_idx - 2].is_empty()
        && tokens[angle_idx - 2].chars().all(|c| c.is_ascii_digit());

    let (tag, series) = if numbered {
        (tokens[..angle_idx - 2].join("_"), tokens[angle_idx - 2].to_string())
    } else {
        (tokens[..angle_idx.saturating_sub(1)].join("_"), "0".to_string())
    };
    Some(TiltInfo {
        tag,
        series,
        angle: tokens[angle_idx].to_string(),
    })
}

fn parse_serialem(name: &str) -> Option<TiltInfo> {
    let delimiter = ['_', '-']
        .into_iter()
        .find(|d| name.matches(*d).count() > 1)
        .unwrap_or('_');
    let tokens: Vec<&str> = name.split(delimiter).collect();
    let series = tokens
        .iter()
        .find(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))?;
    Some(TiltInfo {
        tag: String::new(),
        series: series.to_string(),
        angle: strip_extension(tokens.last()?),
    })
}
