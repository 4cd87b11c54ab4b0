//! Acqsync Context - acquisition-aware grouping of transferred files
//!
//! Every watched root belongs to one acquisition workflow. The first file
//! that [`classify`] recognises selects the workflow's context, and every
//! transferred file after that is handed to it. Contexts turn the flat file
//! stream into groups (tilt series, grid squares, lamellae, CLEM series) and
//! report the groups that become complete.
//!
//! ```text
//! transfer --paths--> [Analyser] --Completion--> agent
//!                        |
//!                  AcquisitionContext::{Tomography, Spa, Fib, Clem, ...}
//! ```

pub mod analyser;
pub mod atlas;
pub mod classify;
pub mod clem;
pub mod error;
pub mod fib;
pub mod mdoc;
pub mod metadata;
pub mod spa;
pub mod tilt;
pub mod tomography;
pub mod types;

pub use analyser::{Analyser, ContextSnapshot};
pub use classify::{classify, ContextKind};
pub use error::{ContextError, Result};
pub use tilt::{TiltFormat, TiltInfo};
pub use types::{AcquisitionGroup, Completion, GroupState};

use acqsync_protocol::defaults::{DEFAULT_TOMO_SOFTWARE, DEFAULT_TOMO_VERSION};
use atlas::AtlasContext;
use clem::ClemContext;
use fib::FibContext;
use metadata::MetadataContext;
use spa::SpaContext;
use std::path::Path;
use tomography::TomographyContext;

/// Per-root settings that shape how contexts read filenames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// `tomo` or `serialem`
    pub tomo_software: String,
    /// Tomo filename convention (`5.7`, `5.11`, `5.12`)
    pub tomo_version: String,
    /// Substrings a tilt image name must contain (case-insensitive)
    pub required_substrings: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            tomo_software: DEFAULT_TOMO_SOFTWARE.to_string(),
            tomo_version: DEFAULT_TOMO_VERSION.to_string(),
            required_substrings: Vec::new(),
        }
    }
}

/// The workflow context for one watched root.
#[derive(Debug)]
pub enum AcquisitionContext {
    Spa(SpaContext),
    SpaMetadata(MetadataContext),
    Tomography(TomographyContext),
    TomographyMetadata(MetadataContext),
    Fib(FibContext),
    Atlas(AtlasContext),
    Clem(ClemContext),
}

impl AcquisitionContext {
    pub fn for_kind(kind: ContextKind, config: &ContextConfig) -> Result<Self> {
        Ok(match kind {
            ContextKind::Spa => AcquisitionContext::Spa(SpaContext::new()),
            ContextKind::SpaMetadata => AcquisitionContext::SpaMetadata(MetadataContext::new()),
            ContextKind::Tomography => {
                let format = TiltFormat::for_software(&config.tomo_software, &config.tomo_version)?;
                AcquisitionContext::Tomography(
                    TomographyContext::new(format).with_required_substrings(config.required_substrings.clone()),
                )
            }
            ContextKind::TomographyMetadata => AcquisitionContext::TomographyMetadata(MetadataContext::new()),
            ContextKind::Fib => AcquisitionContext::Fib(FibContext::new()),
            ContextKind::Atlas => AcquisitionContext::Atlas(AtlasContext::new()),
            ContextKind::Clem => AcquisitionContext::Clem(ClemContext::new()),
        })
    }

    pub fn kind(&self) -> ContextKind {
        match self {
            AcquisitionContext::Spa(_) => ContextKind::Spa,
            AcquisitionContext::SpaMetadata(_) => ContextKind::SpaMetadata,
            AcquisitionContext::Tomography(_) => ContextKind::Tomography,
            AcquisitionContext::TomographyMetadata(_) => ContextKind::TomographyMetadata,
            AcquisitionContext::Fib(_) => ContextKind::Fib,
            AcquisitionContext::Atlas(_) => ContextKind::Atlas,
            AcquisitionContext::Clem(_) => ContextKind::Clem,
        }
    }

    /// Feed one transferred file; returns ids of groups that just completed.
    pub fn post_transfer(&mut self, path: &Path) -> Vec<String> {
        match self {
            AcquisitionContext::Spa(ctx) => ctx.post_transfer(path),
            AcquisitionContext::SpaMetadata(ctx) | AcquisitionContext::TomographyMetadata(ctx) => {
                ctx.post_transfer(path)
            }
            AcquisitionContext::Tomography(ctx) => ctx.post_transfer(path),
            AcquisitionContext::Fib(ctx) => ctx.post_transfer(path),
            AcquisitionContext::Atlas(ctx) => ctx.post_transfer(path),
            AcquisitionContext::Clem(ctx) => ctx.post_transfer(path),
        }
    }

    pub fn groups(&self) -> Vec<AcquisitionGroup> {
        match self {
            AcquisitionContext::Spa(ctx) => ctx.groups(),
            AcquisitionContext::SpaMetadata(_) | AcquisitionContext::TomographyMetadata(_) => Vec::new(),
            AcquisitionContext::Tomography(ctx) => ctx.groups(),
            AcquisitionContext::Fib(ctx) => ctx.groups(),
            AcquisitionContext::Atlas(ctx) => ctx.groups(),
            AcquisitionContext::Clem(ctx) => ctx.groups(),
        }
    }
}
