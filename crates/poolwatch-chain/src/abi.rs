//! Pool contract ABI.
//!
//! Closing events do not carry the liquidity figures the invariant needs, so
//! every log that moves pool liquidity is declared here together with the
//! two view calls used to rebuild them:
//! - `state()` gives the pool liquidity at the end of a block
//! - `positions(key)` gives the liquidity a position locked when it opened

use alloy::primitives::aliases::U96;
use alloy::primitives::{keccak256, Address, B256};
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    event Open(
        address sender,
        address indexed owner,
        uint96 indexed id,
        uint128 liquidityAfter,
        uint160 sqrtPriceX96After,
        uint128 margin
    );

    /// Position closed by its owner.
    #[derive(Debug, PartialEq, Eq)]
    event Settle(
        address sender,
        address indexed owner,
        uint96 indexed id,
        address recipient,
        int256 amount0,
        int256 amount1,
        uint128 liquidityAfter,
        uint160 sqrtPriceX96After
    );

    /// Position force-closed by a liquidator.
    #[derive(Debug, PartialEq, Eq)]
    event Liquidate(
        address indexed owner,
        uint96 indexed id,
        address recipient,
        uint128 liquidityAfter,
        uint160 sqrtPriceX96After,
        uint256 rewards0,
        uint256 rewards1
    );

    #[derive(Debug, PartialEq, Eq)]
    event Swap(
        address indexed sender,
        address indexed recipient,
        int256 amount0,
        int256 amount1,
        uint160 sqrtPriceX96,
        uint128 liquidity,
        int24 tick
    );

    #[derive(Debug, PartialEq, Eq)]
    event Mint(
        address sender,
        address indexed owner,
        uint128 liquidityDelta,
        uint256 amount0,
        uint256 amount1
    );

    #[derive(Debug, PartialEq, Eq)]
    event Burn(
        address indexed owner,
        address recipient,
        uint128 liquidityDelta,
        uint256 amount0,
        uint256 amount1
    );

    interface IMarginalV1Pool {
        function state() external view returns (
            uint160 sqrtPriceX96,
            uint96 totalPositions,
            uint128 liquidity,
            int24 tick,
            uint32 blockTimestamp,
            int56 tickCumulative,
            uint8 feeProtocol,
            bool initialized
        );

        function positions(bytes32 key) external view returns (
            uint128 size,
            uint128 debt0,
            uint128 debt1,
            uint128 insurance0,
            uint128 insurance1,
            bool zeroForOne,
            bool liquidated,
            int24 tick,
            uint32 blockTimestamp,
            int56 tickCumulativeDelta,
            uint128 margin,
            uint128 liquidityLocked,
            uint256 rewards
        );
    }
}

/// topic0 values of every liquidity-changing event, used as the
/// `eth_getLogs` filter.
pub fn pool_topics() -> Vec<B256> {
    vec![
        Open::SIGNATURE_HASH,
        Settle::SIGNATURE_HASH,
        Liquidate::SIGNATURE_HASH,
        Swap::SIGNATURE_HASH,
        Mint::SIGNATURE_HASH,
        Burn::SIGNATURE_HASH,
    ]
}

/// Storage key of a position: `keccak256(abi.encodePacked(owner, id))`.
pub fn position_key(owner: Address, id: U96) -> B256 {
    let mut packed = [0u8; 32];
    packed[..20].copy_from_slice(owner.as_slice());
    packed[20..].copy_from_slice(&id.to_be_bytes::<12>());
    keccak256(packed)
}
