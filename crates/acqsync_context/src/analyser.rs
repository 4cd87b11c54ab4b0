//! Pipeline stage that selects a context and feeds it transferred files.

use crate::classify::{classify, ContextKind};
use crate::error::{ContextError, Result};
use crate::types::{AcquisitionGroup, Completion};
use crate::{AcquisitionContext, ContextConfig};
use acqsync_scout::{Processor, StageIo};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Shared read view of the analyser's context, refreshed after every file.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    inner: Arc<Mutex<Option<(ContextKind, Vec<AcquisitionGroup>)>>>,
}

impl ContextSnapshot {
    pub fn kind(&self) -> Option<ContextKind> {
        self.read().map(|(kind, _)| kind)
    }

    pub fn groups(&self) -> Vec<AcquisitionGroup> {
        self.read().map(|(_, groups)| groups).unwrap_or_default()
    }

    fn read(&self) -> Option<(ContextKind, Vec<AcquisitionGroup>)> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, context: &AcquisitionContext) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some((context.kind(), context.groups()));
    }
}

pub struct Analyser {
    name: String,
    config: ContextConfig,
    context: Option<AcquisitionContext>,
    snapshot: ContextSnapshot,
}

impl Analyser {
    pub fn new(root: &Path, config: ContextConfig) -> Self {
        Self {
            name: format!("analyser:{}", root.display()),
            config,
            context: None,
            snapshot: ContextSnapshot::default(),
        }
    }

    /// Start with a known context instead of classifying the first file.
    pub fn with_context(mut self, kind: ContextKind) -> Result<Self> {
        let context = AcquisitionContext::for_kind(kind, &self.config)?;
        self.snapshot.store(&context);
        self.context = Some(context);
        Ok(self)
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.snapshot.clone()
    }

    pub fn context(&self) -> Option<&AcquisitionContext> {
        self.context.as_ref()
    }

    /// Handle one transferred file.
    pub fn process(&mut self, path: &Path) -> Result<Vec<Completion>> {
        if self.context.is_none() {
            let Some(kind) = classify(path) else {
                debug!(path = %path.display(), "Couldn't find context");
                return Ok(Vec::new());
            };
            info!(context = %kind, path = %path.display(), "Context found");
            self.context = Some(AcquisitionContext::for_kind(kind, &self.config)?);
        }
        let Some(context) = self.context.as_mut() else {
            return Ok(Vec::new());
        };

        let kind = context.kind();
        let completed = context.post_transfer(path);
        self.snapshot.store(context);
        Ok(completed
            .into_iter()
            .map(|group_id| Completion { context: kind, group_id })
            .collect())
    }
}

impl Processor for Analyser {
    type Input = PathBuf;
    type Output = Completion;
    type Error = ContextError;

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, io: &StageIo<PathBuf, Completion>) -> Result<()> {
        while let Some(path) = io.input.get() {
            for completion in self.process(&path)? {
                io.output.put(completion);
            }
        }
        Ok(())
    }
}
