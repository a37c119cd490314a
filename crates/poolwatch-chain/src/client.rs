//! JSON-RPC chain client.
//!
//! The event source talks to the chain through the object-safe
//! [`ChainClient`] trait so tests can substitute [`crate::MockChainClient`].
//! [`RpcClient`] is the production implementation over HTTP JSON-RPC.
//!
//! Pool state is read with `eth_call` at past heights, so the node must
//! serve state for the blocks being scanned (an archive node when catching
//! up from far behind).

use crate::error::{ChainError, ChainResult};
use alloy::primitives::{Address, B256};
use poolwatch_core::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Log query over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    /// Accepted topic0 values (OR-ed).
    pub topics: Vec<B256>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    fn to_params(&self) -> Value {
        let topics: Vec<String> = self.topics.iter().map(|t| hex_prefixed(t)).collect();
        json!([{
            "address": hex_prefixed(self.address),
            "fromBlock": format!("{:#x}", self.from_block),
            "toBlock": format!("{:#x}", self.to_block),
            "topics": [topics],
        }])
    }
}

/// A log as returned by the node, before ABI decoding.
///
/// Location fields are optional because nodes leave them empty for pending
/// logs; the decoder rejects such logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: Option<u64>,
    pub block_hash: Option<B256>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
    pub removed: bool,
}

/// Read access to the chain needed by the event source.
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    fn block_number(&self) -> BoxFuture<'_, ChainResult<u64>>;

    /// Hash of block `number`, `None` if the node does not know it yet.
    fn block_hash(&self, number: u64) -> BoxFuture<'_, ChainResult<Option<B256>>>;

    /// Logs matching `filter`.
    fn get_logs(&self, filter: LogFilter) -> BoxFuture<'_, ChainResult<Vec<RawLog>>>;

    /// Execute a read-only call against `to` with the state as of the end
    /// of block `block`. Returns the raw return data.
    fn call(&self, to: Address, input: Vec<u8>, block: u64) -> BoxFuture<'_, ChainResult<Vec<u8>>>;
}

pub type DynChainClient = Arc<dyn ChainClient>;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
    block_number: Option<String>,
    block_hash: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl RpcLog {
    fn into_raw(self) -> ChainResult<RawLog> {
        let topics = self
            .topics
            .iter()
            .map(|t| parse_b256(t))
            .collect::<ChainResult<Vec<_>>>()?;
        let data = hex::decode(self.data.trim_start_matches("0x"))
            .map_err(|e| ChainError::InvalidResponse(format!("log data: {e}")))?;

        Ok(RawLog {
            address: Address::from_str(&self.address)
                .map_err(|e| ChainError::InvalidResponse(format!("log address: {e}")))?,
            topics,
            data,
            block_number: self.block_number.as_deref().map(parse_quantity).transpose()?,
            block_hash: self.block_hash.as_deref().map(parse_b256).transpose()?,
            transaction_hash: self.transaction_hash.as_deref().map(parse_b256).transpose()?,
            log_index: self.log_index.as_deref().map(parse_quantity).transpose()?,
            removed: self.removed,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    hash: Option<String>,
}

/// HTTP JSON-RPC client.
pub struct RpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Create a client for `url`. `timeout` bounds each HTTP request.
    pub fn new(url: impl Into<String>, timeout: Duration) -> ChainResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: Value) -> ChainResult<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Transport(format!("{method} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Transport(format!("HTTP {status}: {body}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(format!("{method}: {e}")))?;

        if let Some(err) = body.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn fetch_block_number(&self) -> ChainResult<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        let quantity = result
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse(format!("eth_blockNumber: {result}")))?;
        parse_quantity(quantity)
    }

    async fn fetch_block_hash(&self, number: u64) -> ChainResult<Option<B256>> {
        let result = self
            .request("eth_getBlockByNumber", json!([format!("{number:#x}"), false]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let header: RpcBlockHeader = serde_json::from_value(result)
            .map_err(|e| ChainError::InvalidResponse(format!("eth_getBlockByNumber: {e}")))?;
        header.hash.as_deref().map(parse_b256).transpose()
    }

    async fn fetch_logs(&self, filter: LogFilter) -> ChainResult<Vec<RawLog>> {
        let result = self.request("eth_getLogs", filter.to_params()).await?;
        let entries: Vec<Value> = serde_json::from_value(result)
            .map_err(|e| ChainError::InvalidResponse(format!("eth_getLogs: {e}")))?;

        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            // A single malformed entry must not stall the whole range.
            match serde_json::from_value::<RpcLog>(entry)
                .map_err(|e| ChainError::InvalidResponse(e.to_string()))
                .and_then(RpcLog::into_raw)
            {
                Ok(log) => logs.push(log),
                Err(e) => warn!(error = %e, "Skipping malformed log entry"),
            }
        }

        debug!(
            from_block = filter.from_block,
            to_block = filter.to_block,
            count = logs.len(),
            "Fetched logs"
        );
        Ok(logs)
    }

    async fn eth_call(&self, to: Address, input: Vec<u8>, block: u64) -> ChainResult<Vec<u8>> {
        let params = json!([
            { "to": hex_prefixed(to), "data": hex_prefixed(&input) },
            format!("{block:#x}"),
        ]);
        let result = self.request("eth_call", params).await?;
        let data = result
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse(format!("eth_call: {result}")))?;
        hex::decode(data.trim_start_matches("0x"))
            .map_err(|e| ChainError::InvalidResponse(format!("eth_call data: {e}")))
    }
}

impl ChainClient for RpcClient {
    fn block_number(&self) -> BoxFuture<'_, ChainResult<u64>> {
        Box::pin(self.fetch_block_number())
    }

    fn block_hash(&self, number: u64) -> BoxFuture<'_, ChainResult<Option<B256>>> {
        Box::pin(self.fetch_block_hash(number))
    }

    fn get_logs(&self, filter: LogFilter) -> BoxFuture<'_, ChainResult<Vec<RawLog>>> {
        Box::pin(self.fetch_logs(filter))
    }

    fn call(&self, to: Address, input: Vec<u8>, block: u64) -> BoxFuture<'_, ChainResult<Vec<u8>>> {
        Box::pin(self.eth_call(to, input, block))
    }
}

/// Bound a chain call by `timeout`; expiry is a [`ChainError::Timeout`].
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: BoxFuture<'_, ChainResult<T>>,
) -> ChainResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ChainError::Timeout(timeout))?
}

/// Parse a JSON-RPC hex quantity (`"0x1a"`).
pub fn parse_quantity(value: &str) -> ChainResult<u64> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::InvalidResponse(format!("quantity without 0x: {value}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| ChainError::InvalidResponse(format!("quantity {value}: {e}")))
}

fn parse_b256(value: &str) -> ChainResult<B256> {
    B256::from_str(value).map_err(|e| ChainError::InvalidResponse(format!("hash {value}: {e}")))
}

fn hex_prefixed(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("26").is_err());
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn test_log_filter_params() {
        let filter = LogFilter {
            address: Address::repeat_byte(0xab),
            topics: vec![B256::repeat_byte(0x01)],
            from_block: 16,
            to_block: 255,
        };
        let params = filter.to_params();
        assert_eq!(params[0]["fromBlock"], "0x10");
        assert_eq!(params[0]["toBlock"], "0xff");
        assert_eq!(params[0]["address"], format!("0x{}", "ab".repeat(20)));
        assert_eq!(params[0]["topics"][0][0], format!("0x{}", "01".repeat(32)));
    }

    #[test]
    fn test_rpc_log_into_raw() {
        let entry = json!({
            "address": format!("0x{}", "11".repeat(20)),
            "topics": [format!("0x{}", "22".repeat(32))],
            "data": "0x00ff",
            "blockNumber": "0x64",
            "blockHash": format!("0x{}", "33".repeat(32)),
            "transactionHash": format!("0x{}", "44".repeat(32)),
            "logIndex": "0x2",
            "removed": false
        });
        let log = serde_json::from_value::<RpcLog>(entry)
            .unwrap()
            .into_raw()
            .unwrap();

        assert_eq!(log.address, Address::repeat_byte(0x11));
        assert_eq!(log.topics, vec![B256::repeat_byte(0x22)]);
        assert_eq!(log.data, vec![0x00, 0xff]);
        assert_eq!(log.block_number, Some(100));
        assert_eq!(log.transaction_hash, Some(B256::repeat_byte(0x44)));
        assert_eq!(log.log_index, Some(2));
        assert!(!log.removed);
    }

    #[test]
    fn test_pending_log_keeps_empty_location() {
        let entry = json!({
            "address": format!("0x{}", "11".repeat(20)),
            "topics": [],
            "data": "0x",
            "blockNumber": null,
            "blockHash": null,
            "transactionHash": null,
            "logIndex": null
        });
        let log = serde_json::from_value::<RpcLog>(entry)
            .unwrap()
            .into_raw()
            .unwrap();
        assert_eq!(log.block_number, None);
        assert_eq!(log.log_index, None);
        assert!(log.data.is_empty());
    }

    #[test]
    fn test_rpc_client_creation() {
        let client = RpcClient::new("http://localhost:8545", Duration::from_secs(5));
        assert!(client.is_ok());
    }
}
