//! Chain error types.

use alloy::primitives::B256;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the chain. All of them are treated as transient by
/// the event source and retried with backoff.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("Max reconnection attempts reached ({0})")]
    RetriesExhausted(u32),
}

impl ChainError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ChainError::Timeout(_) => "timeout",
            ChainError::Transport(_) => "transport",
            ChainError::Rpc { .. } => "rpc",
            ChainError::InvalidResponse(_) => "invalid_response",
            ChainError::RetriesExhausted(_) => "exhausted",
        }
    }
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Reasons a pool log is skipped instead of being decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Log removed by reorg")]
    Removed,

    #[error("Log missing field: {0}")]
    MissingField(&'static str),

    #[error("Log emitted by foreign address")]
    ForeignAddress,

    #[error("Log has no topics")]
    NoTopics,

    #[error("Unknown event topic: {0}")]
    UnknownTopic(B256),

    #[error("ABI decode failed: {0}")]
    Abi(String),
}

impl DecodeError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Removed => "removed",
            DecodeError::MissingField(_) => "missing_field",
            DecodeError::ForeignAddress => "foreign_address",
            DecodeError::NoTopics => "no_topics",
            DecodeError::UnknownTopic(_) => "unknown_topic",
            DecodeError::Abi(_) => "abi",
        }
    }
}
