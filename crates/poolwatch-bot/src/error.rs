//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] ::config::ConfigError),

    #[error("Chain error: {0}")]
    Chain(#[from] poolwatch_chain::ChainError),

    #[error("Alert error: {0}")]
    Alert(#[from] poolwatch_alert::AlertError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] poolwatch_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] poolwatch_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event source terminated: {0}")]
    SourceTerminated(String),
}

pub type AppResult<T> = Result<T, AppError>;
