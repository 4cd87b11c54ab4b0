//! Error types for Scout

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScoutError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watched root does not exist: {0}")]
    RootMissing(String),

    #[error("Watched root is not a directory: {0}")]
    NotADirectory(String),

    #[error("Failed to spawn stage thread '{stage}': {source}")]
    Spawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Stage '{0}' panicked")]
    StagePanicked(String),
}

pub type Result<T> = std::result::Result<T, ScoutError>;
