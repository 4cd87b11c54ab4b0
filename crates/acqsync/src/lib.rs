//! Acqsync - acquisition data agent
//!
//! Watches instrument output directories, copies new files to the remote
//! store, groups them into acquisition units and keeps the coordinator
//! informed through shared state.

pub mod agent;
pub mod config;

pub use agent::{Agent, RunningAgent, RunningSource, SourceSummary};
pub use config::{AgentConfig, CoordinatorConfig, SourceConfig, TransferConfig};
