//! Chain event source for the pool watcher.
//!
//! Produces the ordered sequence of position-closing events of one pool:
//! - JSON-RPC client (`eth_blockNumber`, `eth_getBlockByNumber`, `eth_getLogs`,
//!   `eth_call`)
//! - Pool event ABI and log decoding
//! - Per-block rebuild of locked and returned liquidity from pool state
//! - Background producer with a bounded queue, resumable from any height
//! - Exponential backoff on transient failures, reorg detection and rescan

pub mod abi;
pub mod client;
pub mod decoder;
pub mod error;
pub mod mock;
pub mod pool;
pub mod source;

pub use abi::position_key;
pub use client::{ChainClient, DynChainClient, LogFilter, RawLog, RpcClient};
pub use decoder::{decode_pool_log, PoolChange, PoolLog};
pub use error::{ChainError, ChainResult, DecodeError};
pub use mock::{ClosingLogBuilder, MockChainClient, MockPoolHistory, PoolOp, BASE_LIQUIDITY};
pub use pool::PoolReader;
pub use source::{EventSource, ReorgPolicy, SourceConfig, SourceEvent};
