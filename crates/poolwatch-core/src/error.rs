//! Error types for poolwatch-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid alert key: {0}")]
    InvalidAlertKey(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
