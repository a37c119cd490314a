//! Deduplication identity of breach alerts.

use alloy::primitives::{keccak256, B256};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::event::PositionId;

/// Identity of a breach alert, derived from
/// `(position_id, block_number, transaction_hash, log_index)`.
///
/// Re-observing the same event (replay after restart, reorg rescan) yields
/// the same key, so a key that was delivered once is never delivered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertKey(B256);

impl AlertKey {
    pub fn derive(
        position_id: &PositionId,
        block_number: u64,
        transaction_hash: &B256,
        log_index: u64,
    ) -> Self {
        let id = position_id.as_str().as_bytes();
        // Length prefix keeps the preimage unambiguous for arbitrary ids.
        let mut preimage = Vec::with_capacity(4 + id.len() + 8 + 32 + 8);
        preimage.extend_from_slice(&(id.len() as u32).to_be_bytes());
        preimage.extend_from_slice(id);
        preimage.extend_from_slice(&block_number.to_be_bytes());
        preimage.extend_from_slice(transaction_hash.as_slice());
        preimage.extend_from_slice(&log_index.to_be_bytes());
        Self(keccak256(&preimage))
    }

    pub fn as_b256(&self) -> &B256 {
        &self.0
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for AlertKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| CoreError::InvalidAlertKey(format!("{s}: {e}")))?;
        if bytes.len() != 32 {
            return Err(CoreError::InvalidAlertKey(format!(
                "{s}: expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(B256::from_slice(&bytes)))
    }
}
