//! Durable monitor state.
//!
//! The monitor has exactly two pieces of mutable state, both written only by
//! the monitor loop:
//! - the checkpoint (last fully processed block)
//! - the alert delivery log (which breach alerts already went out)

pub mod checkpoint;
pub mod delivery_log;
pub mod error;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use delivery_log::{
    DeliveryLog, DeliveryRecord, DeliveryStatus, JsonLinesDeliveryLog, MemoryDeliveryLog,
};
pub use error::{PersistenceError, PersistenceResult};
