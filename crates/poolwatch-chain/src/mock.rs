//! Scripted chain for tests.
//!
//! [`MockPoolHistory`] models one or more pools as an ordered list of
//! [`PoolOp`]s. It renders them into ABI-encoded logs whose liquidity
//! figures are consistent with each other, and answers `state()` and
//! `positions(key)` calls at any height. [`MockChainClient`] serves that
//! history together with a configurable head and block hashes, and can be
//! told to fail the next N calls.

use crate::abi::{position_key, Burn, IMarginalV1Pool, Liquidate, Mint, Open, Settle, Swap};
use crate::client::{ChainClient, LogFilter, RawLog};
use crate::error::{ChainError, ChainResult};
use alloy::primitives::aliases::{I24, U160, U96};
use alloy::primitives::{keccak256, Address, LogData, B256, I256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use parking_lot::Mutex;
use poolwatch_core::{BoxFuture, ClosingEvent, ClosingKind, PositionId};
use std::collections::HashMap;

/// Pool liquidity before the first scripted op.
pub const BASE_LIQUIDITY: u64 = 1_000_000;

/// Liquidity-changing action scripted on a mock pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockChange {
    Open {
        owner: Address,
        id: u64,
        locked: U256,
    },
    Close {
        kind: ClosingKind,
        owner: Address,
        id: u64,
        locked: U256,
        returned: U256,
    },
    Swap {
        liquidity: U256,
    },
    Mint {
        delta: U256,
    },
    Burn {
        delta: U256,
    },
}

/// One scripted pool log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOp {
    pub pool: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub change: MockChange,
}

impl PoolOp {
    fn new(pool: Address, block_number: u64, log_index: u64, change: MockChange) -> Self {
        Self {
            pool,
            block_number,
            log_index,
            transaction_hash: default_tx_hash(block_number, log_index),
            change,
        }
    }

    pub fn open(pool: Address, block: u64, log_index: u64, owner: Address, id: u64, locked: u64) -> Self {
        let change = MockChange::Open {
            owner,
            id,
            locked: U256::from(locked),
        };
        Self::new(pool, block, log_index, change)
    }

    /// Swap that leaves the pool at `liquidity`.
    pub fn swap(pool: Address, block: u64, log_index: u64, liquidity: u64) -> Self {
        let change = MockChange::Swap {
            liquidity: U256::from(liquidity),
        };
        Self::new(pool, block, log_index, change)
    }

    pub fn mint(pool: Address, block: u64, log_index: u64, delta: u64) -> Self {
        let change = MockChange::Mint {
            delta: U256::from(delta),
        };
        Self::new(pool, block, log_index, change)
    }

    pub fn burn(pool: Address, block: u64, log_index: u64, delta: u64) -> Self {
        let change = MockChange::Burn {
            delta: U256::from(delta),
        };
        Self::new(pool, block, log_index, change)
    }

    /// Pool liquidity after this op.
    fn apply(&self, before: U256) -> U256 {
        match &self.change {
            MockChange::Open { locked, .. } => before.saturating_sub(*locked),
            MockChange::Close { returned, .. } => before.saturating_add(*returned),
            MockChange::Swap { liquidity } => *liquidity,
            MockChange::Mint { delta } => before.saturating_add(*delta),
            MockChange::Burn { delta } => before.saturating_sub(*delta),
        }
    }

    /// Locked liquidity of the position this op belongs to, if any.
    fn position(&self) -> Option<(B256, U256)> {
        match &self.change {
            MockChange::Open { owner, id, locked } | MockChange::Close { owner, id, locked, .. } => {
                Some((position_key(*owner, U96::from(*id)), *locked))
            }
            _ => None,
        }
    }

    /// The closing event the watcher is expected to rebuild from this op.
    pub fn closing_event(&self) -> Option<ClosingEvent> {
        match &self.change {
            MockChange::Close {
                kind,
                owner,
                id,
                locked,
                returned,
            } => Some(ClosingEvent {
                kind: *kind,
                position_id: PositionId::from_owner_and_id(owner, U96::from(*id)),
                liquidity_locked: *locked,
                liquidity_returned: *returned,
                block_number: self.block_number,
                transaction_hash: self.transaction_hash,
                log_index: self.log_index,
            }),
            _ => None,
        }
    }

    /// Encode as a node would return it, with `liquidity_after` as the pool
    /// liquidity once the op is applied.
    pub fn render(&self, liquidity_after: U256) -> RawLog {
        let after: u128 = liquidity_after.saturating_to();
        let log_data: LogData = match &self.change {
            MockChange::Open { owner, id, .. } => Open {
                sender: *owner,
                owner: *owner,
                id: U96::from(*id),
                liquidityAfter: after,
                sqrtPriceX96After: U160::ZERO,
                margin: 0,
            }
            .encode_log_data(),
            MockChange::Close {
                kind: ClosingKind::Settled,
                owner,
                id,
                ..
            } => Settle {
                sender: *owner,
                owner: *owner,
                id: U96::from(*id),
                recipient: *owner,
                amount0: I256::ZERO,
                amount1: I256::ZERO,
                liquidityAfter: after,
                sqrtPriceX96After: U160::ZERO,
            }
            .encode_log_data(),
            MockChange::Close {
                kind: ClosingKind::Liquidated,
                owner,
                id,
                ..
            } => Liquidate {
                owner: *owner,
                id: U96::from(*id),
                recipient: Address::repeat_byte(0xee),
                liquidityAfter: after,
                sqrtPriceX96After: U160::ZERO,
                rewards0: U256::ZERO,
                rewards1: U256::ZERO,
            }
            .encode_log_data(),
            MockChange::Swap { .. } => Swap {
                sender: Address::repeat_byte(0x5a),
                recipient: Address::repeat_byte(0x5a),
                amount0: I256::ZERO,
                amount1: I256::ZERO,
                sqrtPriceX96: U160::ZERO,
                liquidity: after,
                tick: I24::ZERO,
            }
            .encode_log_data(),
            MockChange::Mint { delta } => Mint {
                sender: Address::repeat_byte(0x3c),
                owner: Address::repeat_byte(0x3c),
                liquidityDelta: delta.saturating_to(),
                amount0: U256::ZERO,
                amount1: U256::ZERO,
            }
            .encode_log_data(),
            MockChange::Burn { delta } => Burn {
                owner: Address::repeat_byte(0x3c),
                recipient: Address::repeat_byte(0x3c),
                liquidityDelta: delta.saturating_to(),
                amount0: U256::ZERO,
                amount1: U256::ZERO,
            }
            .encode_log_data(),
        };

        RawLog {
            address: self.pool,
            topics: log_data.topics().to_vec(),
            data: log_data.data.to_vec(),
            block_number: Some(self.block_number),
            block_hash: Some(default_block_hash(self.block_number)),
            transaction_hash: Some(self.transaction_hash),
            log_index: Some(self.log_index),
            removed: false,
        }
    }
}

/// Builder for `Settle` / `Liquidate` ops.
#[derive(Debug, Clone)]
pub struct ClosingLogBuilder {
    kind: ClosingKind,
    pool: Address,
    owner: Address,
    id: u64,
    locked: U256,
    returned: U256,
    block_number: u64,
    log_index: u64,
    transaction_hash: Option<B256>,
}

impl ClosingLogBuilder {
    pub fn settle(pool: Address, block_number: u64, log_index: u64) -> Self {
        Self::with_kind(ClosingKind::Settled, pool, block_number, log_index)
    }

    pub fn liquidate(pool: Address, block_number: u64, log_index: u64) -> Self {
        Self::with_kind(ClosingKind::Liquidated, pool, block_number, log_index)
    }

    fn with_kind(kind: ClosingKind, pool: Address, block_number: u64, log_index: u64) -> Self {
        Self {
            kind,
            pool,
            owner: Address::repeat_byte(0x01),
            id: 1,
            locked: U256::from(1000u64),
            returned: U256::from(1000u64),
            block_number,
            log_index,
            transaction_hash: None,
        }
    }

    pub fn position(mut self, owner: Address, id: u64) -> Self {
        self.owner = owner;
        self.id = id;
        self
    }

    pub fn liquidity(mut self, locked: u64, returned: u64) -> Self {
        self.locked = U256::from(locked);
        self.returned = U256::from(returned);
        self
    }

    pub fn transaction_hash(mut self, hash: B256) -> Self {
        self.transaction_hash = Some(hash);
        self
    }

    pub fn build(self) -> PoolOp {
        let change = MockChange::Close {
            kind: self.kind,
            owner: self.owner,
            id: self.id,
            locked: self.locked,
            returned: self.returned,
        };
        let mut op = PoolOp::new(self.pool, self.block_number, self.log_index, change);
        if let Some(hash) = self.transaction_hash {
            op.transaction_hash = hash;
        }
        op
    }
}

/// Scripted pool history plus extra raw logs.
#[derive(Debug, Clone, Default)]
pub struct MockPoolHistory {
    ops: Vec<PoolOp>,
    raw: Vec<RawLog>,
}

impl MockPoolHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: PoolOp) {
        self.ops.push(op);
        self.ops.sort_by_key(|op| (op.block_number, op.log_index));
    }

    /// Add a log served as-is, outside the liquidity model.
    pub fn push_raw(&mut self, log: RawLog) {
        self.raw.push(log);
    }

    /// Rendered and raw logs within `from..=to`, in chain order.
    pub fn logs(&self, from: u64, to: u64) -> Vec<RawLog> {
        let mut liquidity: HashMap<Address, U256> = HashMap::new();
        let mut logs = Vec::new();
        for op in &self.ops {
            let before = *liquidity
                .entry(op.pool)
                .or_insert_with(|| U256::from(BASE_LIQUIDITY));
            let after = op.apply(before);
            liquidity.insert(op.pool, after);
            if (from..=to).contains(&op.block_number) {
                logs.push(op.render(after));
            }
        }
        logs.extend(
            self.raw
                .iter()
                .filter(|log| log.block_number.is_some_and(|n| (from..=to).contains(&n)))
                .cloned(),
        );
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        logs
    }

    /// Liquidity of `pool` at the end of `block`.
    pub fn liquidity_at(&self, pool: Address, block: u64) -> U256 {
        self.ops
            .iter()
            .filter(|op| op.pool == pool && op.block_number <= block)
            .fold(U256::from(BASE_LIQUIDITY), |liquidity, op| op.apply(liquidity))
    }

    /// Locked liquidity recorded for a position key, zero when unknown.
    pub fn liquidity_locked(&self, pool: Address, key: B256) -> U256 {
        self.ops
            .iter()
            .filter(|op| op.pool == pool)
            .filter_map(PoolOp::position)
            .find(|(k, _)| *k == key)
            .map_or(U256::ZERO, |(_, locked)| locked)
    }

    /// Answer a `state()` or `positions(key)` call against `to`.
    pub fn answer_call(&self, to: Address, input: &[u8], block: u64) -> ChainResult<Vec<u8>> {
        if input.starts_with(&IMarginalV1Pool::stateCall::SELECTOR) {
            let mut words = [U256::ZERO; 8];
            words[2] = self.liquidity_at(to, block);
            words[7] = U256::from(1u8);
            return Ok(encode_words(&words));
        }
        if let Ok(call) = IMarginalV1Pool::positionsCall::abi_decode(input, true) {
            let mut words = [U256::ZERO; 13];
            words[11] = self.liquidity_locked(to, call.key);
            return Ok(encode_words(&words));
        }
        Err(ChainError::Rpc {
            code: 3,
            message: "execution reverted".to_string(),
        })
    }
}

/// Block hash served for `number` unless overridden.
pub fn default_block_hash(number: u64) -> B256 {
    B256::left_padding_from(&number.to_be_bytes())
}

fn default_tx_hash(block_number: u64, log_index: u64) -> B256 {
    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&block_number.to_be_bytes());
    seed[8..].copy_from_slice(&log_index.to_be_bytes());
    keccak256(seed)
}

/// ABI encoding of a tuple of static values, one word each.
fn encode_words(words: &[U256]) -> Vec<u8> {
    words
        .iter()
        .flat_map(|word| word.to_be_bytes::<32>())
        .collect()
}

#[derive(Debug, Default)]
struct MockChainState {
    head: u64,
    history: MockPoolHistory,
    hash_overrides: HashMap<u64, B256>,
    fail_next: u32,
    fail_logs: u32,
    fail_calls: u32,
    log_queries: Vec<(u64, u64)>,
    call_count: u32,
}

/// In-memory [`ChainClient`].
///
/// Block hashes default to a value derived from the block number, so a
/// reorg is simulated by overriding the hash of an already scanned block.
#[derive(Debug, Default)]
pub struct MockChainClient {
    state: Mutex<MockChainState>,
}

impl MockChainClient {
    pub fn new(head: u64) -> Self {
        Self {
            state: Mutex::new(MockChainState {
                head,
                ..Default::default()
            }),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    pub fn push_op(&self, op: PoolOp) {
        self.state.lock().history.push(op);
    }

    /// Serve `log` verbatim.
    pub fn push_log(&self, log: RawLog) {
        self.state.lock().history.push_raw(log);
    }

    pub fn set_block_hash(&self, number: u64, hash: B256) {
        self.state.lock().hash_overrides.insert(number, hash);
    }

    /// Fail the next `n` calls of any kind with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Fail the next `n` `get_logs` calls with an RPC error.
    pub fn fail_logs(&self, n: u32) {
        self.state.lock().fail_logs = n;
    }

    /// Fail the next `n` contract calls with a transport error.
    pub fn fail_calls(&self, n: u32) {
        self.state.lock().fail_calls = n;
    }

    /// Inclusive ranges of every `get_logs` call served so far.
    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.state.lock().log_queries.clone()
    }

    /// Contract calls served so far.
    pub fn call_count(&self) -> u32 {
        self.state.lock().call_count
    }

    fn check_failure(state: &mut MockChainState) -> ChainResult<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ChainError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

impl ChainClient for MockChainClient {
    fn block_number(&self) -> BoxFuture<'_, ChainResult<u64>> {
        let result = {
            let mut state = self.state.lock();
            Self::check_failure(&mut state).map(|_| state.head)
        };
        Box::pin(async move { result })
    }

    fn block_hash(&self, number: u64) -> BoxFuture<'_, ChainResult<Option<B256>>> {
        let result = {
            let mut state = self.state.lock();
            Self::check_failure(&mut state).map(|_| {
                if number > state.head {
                    None
                } else {
                    Some(
                        state
                            .hash_overrides
                            .get(&number)
                            .copied()
                            .unwrap_or_else(|| default_block_hash(number)),
                    )
                }
            })
        };
        Box::pin(async move { result })
    }

    fn get_logs(&self, filter: LogFilter) -> BoxFuture<'_, ChainResult<Vec<RawLog>>> {
        let result = {
            let mut state = self.state.lock();
            Self::check_failure(&mut state).and_then(|_| {
                if state.fail_logs > 0 {
                    state.fail_logs -= 1;
                    return Err(ChainError::Rpc {
                        code: -32005,
                        message: "query returned more than 10000 results".to_string(),
                    });
                }
                state.log_queries.push((filter.from_block, filter.to_block));
                Ok(state
                    .history
                    .logs(filter.from_block, filter.to_block)
                    .into_iter()
                    .filter(|log| log.address == filter.address)
                    .filter(|log| {
                        log.topics
                            .first()
                            .map_or(true, |t| filter.topics.contains(t))
                    })
                    .collect())
            })
        };
        Box::pin(async move { result })
    }

    fn call(&self, to: Address, input: Vec<u8>, block: u64) -> BoxFuture<'_, ChainResult<Vec<u8>>> {
        let result = {
            let mut state = self.state.lock();
            Self::check_failure(&mut state).and_then(|_| {
                if state.fail_calls > 0 {
                    state.fail_calls -= 1;
                    return Err(ChainError::Transport("call failed".to_string()));
                }
                state.call_count += 1;
                state.history.answer_call(to, &input, block)
            })
        };
        Box::pin(async move { result })
    }
}
