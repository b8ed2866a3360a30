use std::time::Duration;

use thiserror::Error;

/// Error type for sampling, training, loading and benchmarking
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Dataset is empty")]
    EmptyDataset,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Worker {worker} failed: {message}")]
    WorkerFailed { worker: usize, message: String },

    #[error("Build monitor timed out after {0:?}")]
    MonitorTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    TaskJoin(String),
}

/// Result type alias for crate operations
pub type Result<T> = std::result::Result<T, BenchError>;

impl BenchError {
    /// Errors raised by the engine transport rather than by local validation.
    pub fn is_transport(&self) -> bool {
        matches!(self, BenchError::Transport(_) | BenchError::Io(_))
    }
}

impl From<tokio::task::JoinError> for BenchError {
    fn from(e: tokio::task::JoinError) -> Self {
        BenchError::TaskJoin(e.to_string())
    }
}
