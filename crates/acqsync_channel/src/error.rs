use acqsync_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("No tokio runtime is running; the channel must be opened from async code")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Misuse of the shared-state API from the wrong execution context.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Synchronous state call made inside an async runtime; use the *_async variant")]
    AsyncContext,

    #[error("Asynchronous state call polled outside a tokio runtime; use the synchronous variant")]
    SyncContext,

    #[error("Failed to start a runtime for async subscribers: {0}")]
    Runtime(#[from] std::io::Error),
}
