//! Raw log to [`PoolLog`] decoding.

use crate::abi::{Burn, Liquidate, Mint, Open, Settle, Swap};
use crate::client::RawLog;
use crate::error::DecodeError;
use alloy::primitives::aliases::U96;
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use poolwatch_core::ClosingKind;

/// Effect of one pool log on pool liquidity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolChange {
    Opened {
        liquidity_after: U256,
    },
    Closed {
        kind: ClosingKind,
        owner: Address,
        id: U96,
        liquidity_after: U256,
    },
    Swapped {
        liquidity: U256,
    },
    Minted {
        liquidity_delta: U256,
    },
    Burned {
        liquidity_delta: U256,
    },
}

impl PoolChange {
    /// Pool liquidity once this change is applied to `before`.
    pub fn apply(&self, before: U256) -> U256 {
        match self {
            PoolChange::Opened { liquidity_after }
            | PoolChange::Closed {
                liquidity_after, ..
            } => *liquidity_after,
            PoolChange::Swapped { liquidity } => *liquidity,
            PoolChange::Minted { liquidity_delta } => before.saturating_add(*liquidity_delta),
            PoolChange::Burned { liquidity_delta } => before.saturating_sub(*liquidity_delta),
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, PoolChange::Closed { .. })
    }
}

/// A decoded pool log with its chain location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLog {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub change: PoolChange,
}

/// Decode a pool log.
///
/// Logs of other contracts, removed logs, pending logs and logs whose
/// payload does not match the event ABI are rejected; callers skip them.
pub fn decode_pool_log(log: &RawLog, pool: Address) -> Result<PoolLog, DecodeError> {
    if log.removed {
        return Err(DecodeError::Removed);
    }
    if log.address != pool {
        return Err(DecodeError::ForeignAddress);
    }
    let block_number = log.block_number.ok_or(DecodeError::MissingField("blockNumber"))?;
    let transaction_hash = log
        .transaction_hash
        .ok_or(DecodeError::MissingField("transactionHash"))?;
    let log_index = log.log_index.ok_or(DecodeError::MissingField("logIndex"))?;
    let topic0 = *log.topics.first().ok_or(DecodeError::NoTopics)?;

    let topics = log.topics.iter().copied();
    let data = log.data.as_slice();
    let abi_err = |e: alloy::sol_types::Error| DecodeError::Abi(e.to_string());

    let change = match topic0 {
        t if t == Settle::SIGNATURE_HASH => {
            let ev = Settle::decode_raw_log(topics, data, true).map_err(abi_err)?;
            PoolChange::Closed {
                kind: ClosingKind::Settled,
                owner: ev.owner,
                id: ev.id,
                liquidity_after: U256::from(ev.liquidityAfter),
            }
        }
        t if t == Liquidate::SIGNATURE_HASH => {
            let ev = Liquidate::decode_raw_log(topics, data, true).map_err(abi_err)?;
            PoolChange::Closed {
                kind: ClosingKind::Liquidated,
                owner: ev.owner,
                id: ev.id,
                liquidity_after: U256::from(ev.liquidityAfter),
            }
        }
        t if t == Open::SIGNATURE_HASH => {
            let ev = Open::decode_raw_log(topics, data, true).map_err(abi_err)?;
            PoolChange::Opened {
                liquidity_after: U256::from(ev.liquidityAfter),
            }
        }
        t if t == Swap::SIGNATURE_HASH => {
            let ev = Swap::decode_raw_log(topics, data, true).map_err(abi_err)?;
            PoolChange::Swapped {
                liquidity: U256::from(ev.liquidity),
            }
        }
        t if t == Mint::SIGNATURE_HASH => {
            let ev = Mint::decode_raw_log(topics, data, true).map_err(abi_err)?;
            PoolChange::Minted {
                liquidity_delta: U256::from(ev.liquidityDelta),
            }
        }
        t if t == Burn::SIGNATURE_HASH => {
            let ev = Burn::decode_raw_log(topics, data, true).map_err(abi_err)?;
            PoolChange::Burned {
                liquidity_delta: U256::from(ev.liquidityDelta),
            }
        }
        other => return Err(DecodeError::UnknownTopic(other)),
    };

    Ok(PoolLog {
        block_number,
        transaction_hash,
        log_index,
        change,
    })
}
