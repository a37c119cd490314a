//! Mock HTTP server for end-to-end tests.
//!
//! Serves Ethereum JSON-RPC (`eth_blockNumber`, `eth_getBlockByNumber`,
//! `eth_getLogs`, `eth_call`) on `/` and the Bot API `sendMessage` on
//! `/bot<token>/sendMessage`, over HTTP/1.1 keep-alive. Logs and pool state
//! come from a [`MockPoolHistory`].

use alloy::primitives::{hex, Address, B256};
use parking_lot::Mutex;
use poolwatch_chain::{MockPoolHistory, PoolOp, RawLog};
use std::str::FromStr;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct ServerState {
    head: u64,
    history: MockPoolHistory,
    messages: Vec<String>,
    fail_messages: u32,
}

/// A mock chain node and notification endpoint.
pub struct MockRpcServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    accept_task: JoinHandle<()>,
}

impl MockRpcServer {
    /// Start on an available port.
    pub async fn start(head: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            head,
            ..Default::default()
        }));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    pub fn push_op(&self, op: PoolOp) {
        self.state.lock().history.push(op);
    }

    /// Reject the next `n` sendMessage calls with `ok: false`.
    pub fn fail_messages(&self, n: u32) {
        self.state.lock().fail_messages = n;
    }

    /// Texts accepted by sendMessage.
    pub fn messages(&self) -> Vec<String> {
        self.state.lock().messages.clone()
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for MockRpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let path = request_line
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }

        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let response = if path.ends_with("/sendMessage") {
            handle_send_message(&state, &request)
        } else {
            handle_rpc(&state, &request)
        };

        let payload = response.to_string();
        let http = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            payload.len(),
            payload
        );
        if write.write_all(http.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn handle_send_message(state: &Mutex<ServerState>, request: &Value) -> Value {
    let mut state = state.lock();
    if state.fail_messages > 0 {
        state.fail_messages -= 1;
        return json!({ "ok": false, "description": "Too Many Requests" });
    }
    let text = request["text"].as_str().unwrap_or_default().to_string();
    state.messages.push(text);
    json!({ "ok": true, "result": { "message_id": state.messages.len() } })
}

fn handle_rpc(state: &Mutex<ServerState>, request: &Value) -> Value {
    let state = state.lock();
    let id = request["id"].clone();
    let params = &request["params"];

    let result = match request["method"].as_str().unwrap_or_default() {
        "eth_blockNumber" => json!(format!("{:#x}", state.head)),
        "eth_getBlockByNumber" => {
            let number = parse_quantity(&params[0]);
            if number > state.head {
                Value::Null
            } else {
                json!({ "number": format!("{number:#x}"), "hash": block_hash(number).to_string() })
            }
        }
        "eth_getLogs" => {
            let from = parse_quantity(&params[0]["fromBlock"]);
            let to = parse_quantity(&params[0]["toBlock"]);
            let logs: Vec<Value> = state.history.logs(from, to).iter().map(log_json).collect();
            json!(logs)
        }
        "eth_call" => {
            let to = params[0]["to"]
                .as_str()
                .and_then(|s| Address::from_str(s).ok())
                .unwrap_or_default();
            let input = params[0]["data"]
                .as_str()
                .and_then(|s| hex::decode(s.trim_start_matches("0x")).ok())
                .unwrap_or_default();
            match state.history.answer_call(to, &input, parse_quantity(&params[1])) {
                Ok(output) => json!(format!("0x{}", hex::encode(output))),
                Err(e) => {
                    return json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": 3, "message": e.to_string() }
                    });
                }
            }
        }
        other => {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {other}") }
            });
        }
    };

    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn parse_quantity(value: &Value) -> u64 {
    value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .unwrap_or(0)
}

fn block_hash(number: u64) -> B256 {
    B256::left_padding_from(&number.to_be_bytes())
}

fn log_json(log: &RawLog) -> Value {
    json!({
        "address": log.address.to_string(),
        "topics": log.topics.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
        "data": format!("0x{}", hex::encode(&log.data)),
        "blockNumber": log.block_number.map(|n| format!("{n:#x}")),
        "blockHash": log.block_hash.map(|h| h.to_string()),
        "transactionHash": log.transaction_hash.map(|h| h.to_string()),
        "logIndex": log.log_index.map(|n| format!("{n:#x}")),
        "removed": log.removed,
    })
}
