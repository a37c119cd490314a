//! Persistence error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Checkpoint must not move backwards: current={current}, requested={requested}")]
    NonMonotonic { current: u64, requested: u64 },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
