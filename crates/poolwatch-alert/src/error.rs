//! Alert error types.

use poolwatch_core::AlertKey;
use poolwatch_persistence::PersistenceError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("Notification request failed: {0}")]
    Transport(String),

    #[error("Notification rejected: {0}")]
    Rejected(String),

    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Alert {key} not delivered after {attempts} attempts: {last_error}")]
    DeliveryExhausted {
        key: AlertKey,
        attempts: u32,
        last_error: String,
    },

    #[error("Delivery log error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl AlertError {
    /// Whether the monitor must stop. Only delivery log failures are fatal;
    /// an undelivered alert is retried later.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AlertError::Persistence(_))
    }
}

pub type AlertResult<T> = Result<T, AlertError>;
