//! Pool solvency watcher.
//!
//! Orchestrates the components:
//! - Chain event source (settlements and liquidations of one pool)
//! - Invariant evaluation (`liquidityReturned >= liquidityLocked`)
//! - Deduplicated breach alerts with retry
//! - Checkpointed, resumable block processing

pub mod app;
pub mod config;
pub mod error;
pub mod monitor;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use monitor::{MonitorConfig, MonitorContext, MonitorLoop, MonitorReport, MonitorState};
