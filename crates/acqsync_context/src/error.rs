use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown tomography software '{0}' (expected 'tomo' or 'serialem')")]
    UnknownSoftware(String),

    #[error("Filename conventions for Tomo version {0} unknown")]
    UnknownTomoVersion(String),

    #[error("Malformed metadata in {path}: {reason}")]
    MalformedMetadata { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ContextError>;
