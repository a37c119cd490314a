//! Last fully processed block height.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resume point of the monitor.
///
/// Monotonically non-decreasing; only advanced after every event of a block
/// has been evaluated and every resulting alert delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_processed_block: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(last_processed_block: u64) -> Self {
        Self {
            last_processed_block,
            updated_at: Utc::now(),
        }
    }

    /// First block that still needs scanning.
    pub fn next_block(&self) -> u64 {
        self.last_processed_block.saturating_add(1)
    }
}
