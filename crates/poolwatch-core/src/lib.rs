//! Core domain types for the pool solvency watcher.
//!
//! This crate provides the types shared by every other crate:
//! - `ClosingEvent`: a settled or liquidated position as observed on-chain
//! - `InvariantVerdict`: result of checking `returned >= locked`
//! - `AlertKey`: dedup identity of a breach alert
//! - `Checkpoint`: last fully processed block height
//! - `BackoffConfig`: exponential backoff with full jitter

pub mod alert_key;
pub mod backoff;
pub mod checkpoint;
pub mod error;
pub mod event;
pub mod invariant;

pub use alert_key::AlertKey;
pub use backoff::BackoffConfig;
pub use checkpoint::Checkpoint;
pub use error::{CoreError, Result};
pub use event::{BlockEvents, ClosingEvent, ClosingKind, EventCursor, PositionId};
pub use invariant::{evaluate, InvariantVerdict};

/// Re-exported so downstream crates agree on the numeric and hash types.
pub use alloy::primitives::{Address, B256, U256};

use std::future::Future;
use std::pin::Pin;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
