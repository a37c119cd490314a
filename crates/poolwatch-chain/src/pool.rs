//! Liquidity reconstruction for closing events.
//!
//! The pool does not log how much liquidity a closing position gave back.
//! For a block holding a `Settle` or `Liquidate`, the pool liquidity at the
//! end of the previous block is read and walked through the block's pool
//! logs in log order. A closing event returned the difference between the
//! liquidity after it and the liquidity before it. The liquidity it had
//! locked is the position record as of the previous block.

use crate::abi::{position_key, IMarginalV1Pool};
use crate::client::{with_timeout, DynChainClient};
use crate::decoder::{PoolChange, PoolLog};
use crate::error::{ChainError, ChainResult};
use alloy::primitives::aliases::U96;
use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use poolwatch_core::{ClosingEvent, PositionId};
use std::time::Duration;
use tracing::{debug, warn};

/// Historical reads of one pool.
#[derive(Clone)]
pub struct PoolReader {
    client: DynChainClient,
    pool: Address,
    call_timeout: Duration,
}

impl PoolReader {
    pub fn new(client: DynChainClient, pool: Address, call_timeout: Duration) -> Self {
        Self {
            client,
            pool,
            call_timeout,
        }
    }

    /// Pool liquidity at the end of `block`.
    pub async fn liquidity_at(&self, block: u64) -> ChainResult<U256> {
        let input = IMarginalV1Pool::stateCall {}.abi_encode();
        let output = self.eth_call(input, block).await?;
        let state = IMarginalV1Pool::stateCall::abi_decode_returns(&output, true)
            .map_err(|e| ChainError::InvalidResponse(format!("state(): {e}")))?;
        Ok(U256::from(state.liquidity))
    }

    /// Liquidity locked by position `(owner, id)` as of the end of `block`.
    pub async fn liquidity_locked_at(&self, owner: Address, id: U96, block: u64) -> ChainResult<U256> {
        let key = position_key(owner, id);
        let input = IMarginalV1Pool::positionsCall { key }.abi_encode();
        let output = self.eth_call(input, block).await?;
        let position = IMarginalV1Pool::positionsCall::abi_decode_returns(&output, true)
            .map_err(|e| ChainError::InvalidResponse(format!("positions({key}): {e}")))?;
        Ok(U256::from(position.liquidityLocked))
    }

    /// Closing events of `block`, rebuilt from its pool logs.
    ///
    /// `logs` must hold every decoded pool log of the block. Blocks without
    /// a closing log cost no calls.
    pub async fn closing_events(&self, block: u64, logs: &[PoolLog]) -> ChainResult<Vec<ClosingEvent>> {
        if !logs.iter().any(|log| log.change.is_closing()) {
            return Ok(Vec::new());
        }

        let mut ordered: Vec<&PoolLog> = logs.iter().collect();
        ordered.sort_by_key(|log| log.log_index);

        let previous = block.saturating_sub(1);
        let mut liquidity = self.liquidity_at(previous).await?;
        debug!(block, liquidity = %liquidity, "Pool liquidity at end of previous block");

        let mut events = Vec::new();
        for log in ordered {
            let after = log.change.apply(liquidity);

            if let PoolChange::Closed { kind, owner, id, .. } = &log.change {
                let liquidity_returned = match after.checked_sub(liquidity) {
                    Some(returned) => returned,
                    None => {
                        warn!(
                            block,
                            log_index = log.log_index,
                            before = %liquidity,
                            after = %after,
                            "Pool liquidity fell on close, counting nothing as returned"
                        );
                        U256::ZERO
                    }
                };
                let liquidity_locked = self.liquidity_locked_at(*owner, *id, previous).await?;

                events.push(ClosingEvent {
                    kind: *kind,
                    position_id: PositionId::from_owner_and_id(owner, id),
                    liquidity_locked,
                    liquidity_returned,
                    block_number: block,
                    transaction_hash: log.transaction_hash,
                    log_index: log.log_index,
                });
            }

            liquidity = after;
        }
        Ok(events)
    }

    async fn eth_call(&self, input: Vec<u8>, block: u64) -> ChainResult<Vec<u8>> {
        with_timeout(self.call_timeout, self.client.call(self.pool, input, block)).await
    }
}
