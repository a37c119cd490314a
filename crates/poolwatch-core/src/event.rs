//! Position-closing events observed on the pool contract.

use alloy::primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::alert_key::AlertKey;

/// How a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosingKind {
    /// Voluntary close by the position owner.
    Settled,
    /// Forced close of an undercollateralized or expired position.
    Liquidated,
}

impl ClosingKind {
    /// Lowercase label used in metrics and persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClosingKind::Settled => "settled",
            ClosingKind::Liquidated => "liquidated",
        }
    }
}

impl fmt::Display for ClosingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosingKind::Settled => write!(f, "Settled"),
            ClosingKind::Liquidated => write!(f, "Liquidated"),
        }
    }
}

/// Opaque position identifier.
///
/// The pool keys positions by `(owner, id)`; decoded events render that pair
/// as `"<owner>:<id>"`. Tests and fixtures may use any non-empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(String);

impl PositionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the identifier for an on-chain `(owner, id)` pair.
    pub fn from_owner_and_id(owner: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self(format!("{owner}:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a log in the chain.
///
/// Derived `Ord` is lexicographic over `(block_number, log_index)`, which is
/// the order events are emitted and alerts are delivered in. `log_index` is
/// unique within a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventCursor {
    pub block_number: u64,
    pub log_index: u64,
}

impl EventCursor {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_number, self.log_index)
    }
}

/// A settlement or liquidation of a pool position.
///
/// Immutable once constructed; uniquely identified by
/// `(block_number, transaction_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosingEvent {
    pub kind: ClosingKind,
    pub position_id: PositionId,
    /// Liquidity reserved for the position when it was opened.
    pub liquidity_locked: U256,
    /// Liquidity handed back to the pool when the position closed.
    pub liquidity_returned: U256,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl ClosingEvent {
    pub fn cursor(&self) -> EventCursor {
        EventCursor::new(self.block_number, self.log_index)
    }

    pub fn alert_key(&self) -> AlertKey {
        AlertKey::derive(
            &self.position_id,
            self.block_number,
            &self.transaction_hash,
            self.log_index,
        )
    }
}

/// All closing events of a single block, in log-index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEvents {
    pub block_number: u64,
    pub events: Vec<ClosingEvent>,
}

impl BlockEvents {
    /// Group events of one block. Events are sorted by log index; events of
    /// other blocks are a caller bug.
    pub fn new(block_number: u64, mut events: Vec<ClosingEvent>) -> Self {
        debug_assert!(events.iter().all(|e| e.block_number == block_number));
        events.sort_by_key(|e| e.log_index);
        Self {
            block_number,
            events,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}
