//! Wires one pipeline per watched source and publishes its progress.
//!
//! ```text
//! FileWatcher --FileBatch--> TransferPipe --PathBuf--> Analyser --Completion--> sink
//!                                 |                       |                      |
//!                     transfer.<name>, metrics      (context groups)      groups.<name>
//!                                  \_____________ SharedState ________________/
//! ```
//!
//! Stages run on their own threads and write to [`SharedState`] with the
//! synchronous API. A bound coordinator channel forwards every change.

use crate::config::{AgentConfig, SourceConfig, TransferConfig};
use acqsync_channel::SharedState;
use acqsync_context::{Analyser, Completion, ContextSnapshot};
use acqsync_protocol::StateValue;
use acqsync_scout::{FileWatcher, Pipeline, RunningPipeline};
use acqsync_worker::{CopyTool, TransferLedger, TransferPipe, METRICS};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// State key for a source's transfer counters.
pub fn transfer_key(source: &str) -> String {
    format!("transfer.{}", source)
}

/// State key for a source's acquisition groups.
pub fn groups_key(source: &str) -> String {
    format!("groups.{}", source)
}

/// State key for the last file a source registered.
pub fn registered_key(source: &str) -> String {
    format!("registered.{}", source)
}

pub const METRICS_KEY: &str = "metrics";

fn publish(state: &SharedState, key: &str, value: impl Serialize) {
    let value = match serde_json::to_value(value) {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "Failed to serialize state value");
            return;
        }
    };
    if let Err(e) = state.set(key, value) {
        warn!(key, error = %e, "Failed to update shared state");
    }
}

#[derive(Serialize)]
struct GroupsView<'a> {
    context: Option<String>,
    groups: &'a [acqsync_context::AcquisitionGroup],
}

fn publish_groups(state: &SharedState, source: &str, snapshot: &ContextSnapshot) {
    let groups = snapshot.groups();
    publish(
        state,
        &groups_key(source),
        GroupsView {
            context: snapshot.kind().map(|k| k.to_string()),
            groups: &groups,
        },
    );
}

pub struct Agent {
    config: AgentConfig,
    state: SharedState,
}

impl Agent {
    pub fn new(config: AgentConfig, state: SharedState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Start every source with rsync.
    pub fn start(&self) -> Result<RunningAgent> {
        let transfer = self.config.transfer.clone();
        self.start_with(|_| transfer.rsync())
    }

    /// Start every source with a copy tool built by `make_tool`.
    pub fn start_with<T, F>(&self, make_tool: F) -> Result<RunningAgent>
    where
        T: CopyTool + 'static,
        F: Fn(&SourceConfig) -> T,
    {
        let mut sources = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            let running = start_source(source, &self.config.transfer, make_tool(source), self.state.clone())
                .with_context(|| format!("Failed to start source {}", source.display_name()))?;
            sources.push(running);
        }
        info!(sources = sources.len(), "Agent started");
        Ok(RunningAgent { sources })
    }
}

/// One source's stages plus the thread that publishes its completions.
pub struct RunningSource {
    name: String,
    pipeline: RunningPipeline<Completion>,
    sink: JoinHandle<Vec<Completion>>,
    ledger: TransferLedger,
    snapshot: ContextSnapshot,
}

impl RunningSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    pub fn snapshot(&self) -> &ContextSnapshot {
        &self.snapshot
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.pipeline.stage_names()
    }

    pub fn is_finished(&self) -> bool {
        self.sink.is_finished()
    }
}

pub struct RunningAgent {
    sources: Vec<RunningSource>,
}

/// What a source did before it stopped.
#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub name: String,
    pub completions: Vec<Completion>,
    pub transferred: u64,
    /// Already up to date at the destination
    pub unchanged: u64,
    pub failed: u64,
}

impl RunningAgent {
    pub fn sources(&self) -> &[RunningSource] {
        &self.sources
    }

    /// True once every source pipeline has drained (normally only after a
    /// stage error or cancellation).
    pub fn all_finished(&self) -> bool {
        self.sources.iter().all(RunningSource::is_finished)
    }

    /// Cancel the watchers; each pipeline flushes and drains before stopping.
    pub fn cancel(&self) {
        for source in &self.sources {
            source.pipeline.cancel();
        }
    }

    /// Wait for every source. Returns the first stage error after all
    /// sources have stopped.
    pub fn join(self) -> Result<Vec<SourceSummary>> {
        let mut summaries = Vec::new();
        let mut first_error = None;
        for source in self.sources {
            let RunningSource {
                name,
                pipeline,
                sink,
                ledger,
                ..
            } = source;
            if let Err(e) = pipeline.join() {
                warn!(source = %name, error = %e, "Source pipeline failed");
                first_error.get_or_insert(anyhow::Error::new(e).context(format!("source {}", name)));
            }
            let completions = match sink.join() {
                Ok(completions) => completions,
                Err(_) => {
                    first_error.get_or_insert(anyhow::anyhow!("completion sink for {} panicked", name));
                    Vec::new()
                }
            };
            summaries.push(SourceSummary {
                name,
                completions,
                transferred: ledger.transferred_count(),
                unchanged: ledger.unchanged_count(),
                failed: ledger.failed_count(),
            });
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }
}

fn start_source<T: CopyTool + 'static>(
    source: &SourceConfig,
    transfer: &TransferConfig,
    tool: T,
    state: SharedState,
) -> Result<RunningSource> {
    let name = source.display_name();
    info!(
        source = %name,
        root = %source.root.display(),
        destination = %source.destination.display(),
        "Starting source"
    );

    let watcher = FileWatcher::new(source.watch_config());

    let registrar_state = state.clone();
    let registrar_key = registered_key(&name);
    let pipe = TransferPipe::new(&source.root, &source.destination, tool)
        .with_retry(transfer.retry_policy())
        .with_registrar(move |destination: &Path| {
            debug!(destination = %destination.display(), "Registering transferred file");
            publish(
                &registrar_state,
                &registrar_key,
                StateValue::String(destination.display().to_string()),
            );
        });
    let ledger = pipe.ledger();
    let observer_ledger = ledger.clone();
    let observer_state = state.clone();
    let observer_name = name.clone();
    let pipe = pipe.with_observer(move |_report| {
        publish(
            &observer_state,
            &transfer_key(&observer_name),
            observer_ledger.progress(&observer_name),
        );
        publish(&observer_state, METRICS_KEY, METRICS.snapshot());
    });

    let mut analyser = Analyser::new(&source.root, source.context_config());
    if let Some(kind) = source.context {
        analyser = analyser.with_context(kind)?;
    }
    let snapshot = analyser.snapshot();

    let pipeline = Pipeline::source(watcher).then(pipe).then(analyser).start()?;

    let output = pipeline.output().clone();
    let sink_snapshot = snapshot.clone();
    let sink_name = name.clone();
    let sink = thread::Builder::new()
        .name(format!("completions:{}", name))
        .spawn(move || {
            let mut completions = Vec::new();
            while let Some(completion) = output.get() {
                info!(
                    source = %sink_name,
                    context = %completion.context,
                    group = %completion.group_id,
                    "Acquisition group complete"
                );
                publish_groups(&state, &sink_name, &sink_snapshot);
                completions.push(completion);
            }
            // Final view, including groups that never completed.
            publish_groups(&state, &sink_name, &sink_snapshot);
            completions
        })
        .context("Failed to spawn completion sink")?;

    Ok(RunningSource {
        name,
        pipeline,
        sink,
        ledger,
        snapshot,
    })
}
