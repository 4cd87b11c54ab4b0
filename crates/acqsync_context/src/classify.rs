//! First-file classification into an acquisition context.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Acquisition workflow a watched root belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Spa,
    SpaMetadata,
    Tomography,
    TomographyMetadata,
    Fib,
    Atlas,
    Clem,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Spa => "spa",
            ContextKind::SpaMetadata => "spa_metadata",
            ContextKind::Tomography => "tomography",
            ContextKind::TomographyMetadata => "tomography_metadata",
            ContextKind::Fib => "fib",
            ContextKind::Atlas => "atlas",
            ContextKind::Clem => "clem",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const MOVIE_ENDINGS: &[&str] = &["Fractions", "fractions", "EER"];

fn has_component(path: &Path, name: &str) -> bool {
    path.components().any(|c| c.as_os_str() == name)
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("")
}

/// Decide which context a file belongs to. Rules are checked in order and
/// the first match wins; `None` means the file says nothing about the
/// workflow.
pub fn classify(path: &Path) -> Option<ContextKind> {
    let name = path.file_name()?.to_string_lossy();
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let ext = extension(path);

    // Leica exports: PositionXX--ZXX--CXX.tif
    if matches!(ext, "lif" | "xlif")
        || (matches!(ext, "tif" | "tiff") && name.contains("--Z") && name.contains("--C"))
    {
        return Some(ContextKind::Clem);
    }
    if has_component(path, "atlas") {
        return Some(ContextKind::Atlas);
    }
    if has_component(path, "Metadata") || name == "EpuSession.dm" {
        return Some(ContextKind::SpaMetadata);
    }
    if has_component(path, "Batch")
        || has_component(path, "SearchMaps")
        || has_component(path, "Thumbnails")
        || name == "Session.dm"
    {
        return Some(ContextKind::TomographyMetadata);
    }
    if ext == "png" && has_component(path, "DCImages") && has_component(path, "Sites") {
        return Some(ContextKind::Fib);
    }

    let tokens: Vec<&str> = stem.split('_').collect();
    let first = tokens.first().copied().unwrap_or("");
    let last = tokens.last().copied().unwrap_or("");

    if last == "gain" {
        return None;
    }
    if first.starts_with("FoilHole") && MOVIE_ENDINGS.contains(&last) {
        return Some(ContextKind::Spa);
    }
    if first == "Position" || name.contains('[') || MOVIE_ENDINGS.contains(&last) || ext == "mdoc" {
        return Some(ContextKind::Tomography);
    }
    None
}
