//! Prometheus metrics and structured logging for the pool watcher.
//!
//! - Prometheus metrics for chain ingestion, invariant breaches and alert delivery
//! - Structured logging with tracing (pretty in development, JSON in production)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
