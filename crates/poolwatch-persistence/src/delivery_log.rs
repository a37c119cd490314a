//! Alert delivery log.
//!
//! Uses JSON Lines (.jsonl) for robustness:
//! - Each line is a complete record, appended and fsynced before the caller
//!   proceeds
//! - Partial corruption only affects individual lines, which are skipped on
//!   reload
//!
//! The set of delivered keys is rebuilt from the file on open, so dedup
//! survives restarts for as long as the file lives next to the checkpoint.

use crate::error::PersistenceResult;
use chrono::Utc;
use parking_lot::Mutex;
use poolwatch_core::{AlertKey, ClosingKind, InvariantVerdict};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Final state of one dispatch of one alert key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted by the notification channel.
    Delivered,
    /// Retries exhausted; the block stays unprocessed.
    Failed,
    /// Operator accepted the loss; the block may be checkpointed.
    Abandoned,
}

/// One line of the delivery log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub alert_key: String,
    pub position_id: String,
    pub kind: ClosingKind,
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub recorded_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryRecord {
    pub fn new(
        verdict: &InvariantVerdict,
        status: DeliveryStatus,
        attempts: u32,
        error: Option<String>,
    ) -> Self {
        let event = &verdict.event;
        Self {
            alert_key: verdict.alert_key().to_string(),
            position_id: event.position_id.to_string(),
            kind: event.kind,
            block_number: event.block_number,
            transaction_hash: event.transaction_hash.to_string(),
            log_index: event.log_index,
            status,
            attempts,
            recorded_at_ms: Utc::now().timestamp_millis(),
            error,
        }
    }

    /// Parsed key, `None` if the stored string is malformed.
    pub fn key(&self) -> Option<AlertKey> {
        self.alert_key.parse().ok()
    }
}

/// Record of which breach alerts were delivered.
pub trait DeliveryLog: Send {
    /// Whether an alert with this key was already delivered.
    fn is_delivered(&self, key: &AlertKey) -> bool;

    /// Durably append a record. A `Delivered` record makes its key
    /// report as delivered from then on.
    fn record(&mut self, record: DeliveryRecord) -> PersistenceResult<()>;
}

/// Append-only JSON Lines delivery log.
pub struct JsonLinesDeliveryLog {
    path: PathBuf,
    writer: BufWriter<File>,
    delivered: HashSet<AlertKey>,
}

impl JsonLinesDeliveryLog {
    /// Open (or create) the log and rebuild the delivered-key set.
    pub fn open(path: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let delivered = Self::replay(&path)?;

        // Open in append mode - won't truncate existing data
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!(
            path = %path.display(),
            delivered = delivered.len(),
            "Opened alert delivery log"
        );

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            delivered,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> PersistenceResult<HashSet<AlertKey>> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut delivered = HashSet::new();
        let complete = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);

        for (line_no, line) in content[..complete].split(|&b| b == b'\n').enumerate() {
            Self::replay_line(line, line_no + 1, &mut delivered);
        }

        if complete < content.len() {
            Self::repair_tail(path, &content[complete..], complete, &mut delivered)?;
        }
        Ok(delivered)
    }

    fn replay_line(line: &[u8], line_no: usize, delivered: &mut HashSet<AlertKey>) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match serde_json::from_slice::<DeliveryRecord>(line) {
            Ok(record) if record.status == DeliveryStatus::Delivered => match record.key() {
                Some(key) => {
                    delivered.insert(key);
                }
                None => warn!(line = line_no, "Skipping record with malformed alert key"),
            },
            Ok(_) => {}
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping corrupt delivery log line");
            }
        }
    }

    /// Handle bytes after the last newline, left by a crash mid-append.
    ///
    /// A complete record only lacking its newline is kept and terminated.
    /// Anything else is cut off so the next append starts on a fresh line.
    fn repair_tail(
        path: &Path,
        tail: &[u8],
        complete: usize,
        delivered: &mut HashSet<AlertKey>,
    ) -> PersistenceResult<()> {
        let parsed = serde_json::from_slice::<DeliveryRecord>(tail).is_ok();
        let mut file = OpenOptions::new().write(true).open(path)?;

        if parsed {
            Self::replay_line(tail, 0, delivered);
            file.seek(SeekFrom::End(0))?;
            file.write_all(b"\n")?;
            info!(path = %path.display(), "Terminated unterminated delivery log record");
        } else {
            file.set_len(complete as u64)?;
            warn!(
                path = %path.display(),
                torn_bytes = tail.len(),
                "Truncated torn delivery log tail"
            );
        }
        file.sync_all()?;
        Ok(())
    }
}

impl DeliveryLog for JsonLinesDeliveryLog {
    fn is_delivered(&self, key: &AlertKey) -> bool {
        self.delivered.contains(key)
    }

    fn record(&mut self, record: DeliveryRecord) -> PersistenceResult<()> {
        let json = serde_json::to_string(&record)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        debug!(
            alert_key = %record.alert_key,
            status = ?record.status,
            attempts = record.attempts,
            "Delivery record appended"
        );

        if record.status == DeliveryStatus::Delivered {
            if let Some(key) = record.key() {
                self.delivered.insert(key);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLogState {
    records: Vec<DeliveryRecord>,
    delivered: HashSet<AlertKey>,
}

/// In-memory delivery log. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeliveryLog {
    state: Arc<Mutex<MemoryLogState>>,
}

impl MemoryDeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records appended so far.
    pub fn records(&self) -> Vec<DeliveryRecord> {
        self.state.lock().records.clone()
    }
}

impl DeliveryLog for MemoryDeliveryLog {
    fn is_delivered(&self, key: &AlertKey) -> bool {
        self.state.lock().delivered.contains(key)
    }

    fn record(&mut self, record: DeliveryRecord) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        if record.status == DeliveryStatus::Delivered {
            if let Some(key) = record.key() {
                state.delivered.insert(key);
            }
        }
        state.records.push(record);
        Ok(())
    }
}
