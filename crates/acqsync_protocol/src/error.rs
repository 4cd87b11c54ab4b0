use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid coordinator URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unsupported coordinator URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Message is missing the '{0}' field")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
