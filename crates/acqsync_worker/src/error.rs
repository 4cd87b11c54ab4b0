use thiserror::Error;

/// Longest stderr excerpt carried in a failure message.
const STDERR_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to launch copy tool '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Copy tool not found on PATH: {0}")]
    ToolNotFound(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Why a copy invocation did not complete cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CopyFailure {
    /// Retrying will not help (bad arguments, protocol mismatch)
    #[error("Permanent copy failure (no retry): {message}")]
    Permanent { message: String },

    /// May succeed on retry (partial transfer, I/O error, timeout)
    #[error("Transient copy failure (retry eligible): {message}")]
    Transient { message: String },
}

impl CopyFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, CopyFailure::Transient { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, CopyFailure::Permanent { .. })
    }

    /// Classify an rsync exit code:
    /// - 1 (syntax/usage), 2 (protocol incompatibility), 4 (unsupported action): Permanent
    /// - Other, including 23/24 (partial transfer) and 10/11/12/30/35 (I/O, timeouts): Transient
    pub fn from_exit_code(code: i32, stderr: &str) -> Self {
        let message = describe(&format!("Copy tool exited with code {}", code), stderr);
        match code {
            1 | 2 | 4 => CopyFailure::Permanent { message },
            _ => CopyFailure::Transient { message },
        }
    }

    /// The tool was killed by a signal; treated as transient.
    pub fn from_signal(stderr: &str) -> Self {
        CopyFailure::Transient {
            message: describe("Copy tool terminated by signal", stderr),
        }
    }
}

fn describe(headline: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return headline.to_string();
    }
    match stderr.char_indices().nth(STDERR_EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}: {}... (truncated)", headline, &stderr[..cut]),
        None => format!("{}: {}", headline, stderr),
    }
}
