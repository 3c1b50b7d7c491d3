use thiserror::Error;

/// Errors produced by the chunk planner, HTTP primitives, and task worker.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("probe failed: {0}")]
    Probe(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server returned unexpected status {status} for {context}")]
    ServerContract { status: u16, context: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task was cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;
