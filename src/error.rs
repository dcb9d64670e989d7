use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegsrvError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Segment server not ready: {0}")]
    Unready(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("No data: {0}")]
    DataGap(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Computation cancelled")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SegsrvError>;
