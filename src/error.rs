use thiserror::Error;

/// Failure of a single HTTP call. Messages are shown to users verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("request URL is empty")]
    EmptyUrl,

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// Reasons a step ends in `error`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Network(#[from] RequestError),

    #[error("template store error: {0}")]
    Store(String),
}
