//! Background producer of ordered pool closing events.
//!
//! Scans confirmed blocks in bounded ranges and pushes one
//! [`SourceEvent::Block`] per block that has closing events, strictly in
//! `(block_number, log_index)` order, into a bounded channel. A full channel
//! suspends the producer. Progress markers let the consumer advance its
//! checkpoint across empty ranges.
//!
//! Each poll finishes every chain read of a range (logs, block hash and the
//! pool state reads behind [`PoolReader`]) before anything is emitted.
//! Transient chain failures are retried from the same unconfirmed height
//! with exponential backoff; no range is skipped. The failure count only
//! resets once a whole poll has succeeded.

use crate::abi::pool_topics;
use crate::client::{with_timeout, DynChainClient, LogFilter, RawLog};
use crate::decoder::{decode_pool_log, PoolLog};
use crate::error::{ChainError, ChainResult};
use crate::pool::PoolReader;
use alloy::primitives::{Address, B256};
use poolwatch_core::{BackoffConfig, BlockEvents};
use poolwatch_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do when a scanned block is no longer canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgPolicy {
    /// Rewind and scan again after a detected reorg.
    #[serde(default = "default_rescan_enabled")]
    pub rescan_enabled: bool,
    /// Blocks to rewind, counted back from the last scanned block.
    #[serde(default = "default_rescan_depth")]
    pub rescan_depth: u64,
}

fn default_rescan_enabled() -> bool {
    true
}

fn default_rescan_depth() -> u64 {
    12
}

impl Default for ReorgPolicy {
    fn default() -> Self {
        Self {
            rescan_enabled: default_rescan_enabled(),
            rescan_depth: default_rescan_depth(),
        }
    }
}

/// Event source configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub pool_address: Address,
    /// Blocks behind head considered final.
    pub confirmations: u64,
    /// Largest block span per `eth_getLogs` call.
    pub max_block_range: u64,
    /// Delay between polls once caught up.
    pub poll_interval: Duration,
    /// Bound on each chain call.
    pub call_timeout: Duration,
    /// Capacity of the event channel.
    pub queue_capacity: usize,
    /// Consecutive failures before giving up (0 = infinite).
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffConfig,
    pub reorg: ReorgPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            pool_address: Address::ZERO,
            confirmations: 2,
            max_block_range: 2000,
            poll_interval: Duration::from_millis(4000),
            call_timeout: Duration::from_millis(10_000),
            queue_capacity: 64,
            max_reconnect_attempts: 0,
            backoff: BackoffConfig::default(),
            reorg: ReorgPolicy::default(),
        }
    }
}

/// Items delivered to the consumer, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// All closing events of one block.
    Block(BlockEvents),
    /// Every block up to `scanned_through` has been delivered.
    Progress { scanned_through: u64, safe_head: u64 },
    /// A chain call failed; the source is backing off.
    Disconnected { reason: String, attempt: u32 },
    /// A full poll succeeded after one or more failures.
    Reconnected,
}

enum PollOutcome {
    /// More confirmed blocks remain; poll again immediately.
    Behind,
    /// Scanned through the confirmed head.
    CaughtUp,
    /// Consumer dropped the receiver or shutdown was requested.
    Stopped,
}

/// Producer task state.
pub struct EventSource {
    client: DynChainClient,
    reader: PoolReader,
    config: SourceConfig,
    topics: Vec<B256>,
    /// First block the source was asked to deliver; rescans never go below it.
    floor: u64,
    next_block: u64,
    /// Last scanned block and its hash, re-checked on every poll.
    last_scanned: Option<(u64, B256)>,
    failures: u32,
    tx: mpsc::Sender<SourceEvent>,
    cancel: CancellationToken,
}

impl EventSource {
    /// Start producing from `start_block` (inclusive).
    ///
    /// The task finishes with `Ok(())` on cancellation or when the receiver
    /// is dropped, and with [`ChainError::RetriesExhausted`] when a bounded
    /// retry budget runs out.
    pub fn spawn(
        client: DynChainClient,
        config: SourceConfig,
        start_block: u64,
        cancel: CancellationToken,
    ) -> (JoinHandle<ChainResult<()>>, mpsc::Receiver<SourceEvent>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let reader = PoolReader::new(client.clone(), config.pool_address, config.call_timeout);
        let source = Self {
            client,
            reader,
            config,
            topics: pool_topics(),
            floor: start_block,
            next_block: start_block,
            last_scanned: None,
            failures: 0,
            tx,
            cancel,
        };
        (tokio::spawn(source.run()), rx)
    }

    async fn run(mut self) -> ChainResult<()> {
        info!(
            pool = %self.config.pool_address,
            start_block = self.next_block,
            confirmations = self.config.confirmations,
            "Chain event source started"
        );

        loop {
            if self.cancel.is_cancelled() {
                info!(next_block = self.next_block, "Shutdown requested, stopping event source");
                return Ok(());
            }

            match self.poll_once().await {
                Ok(PollOutcome::Behind) => {}
                Ok(PollOutcome::CaughtUp) => {
                    if !self.sleep(self.config.poll_interval).await {
                        return Ok(());
                    }
                }
                Ok(PollOutcome::Stopped) => {
                    info!(next_block = self.next_block, "Event source stopped");
                    return Ok(());
                }
                Err(e) => {
                    self.failures += 1;
                    Metrics::chain_reconnect(e.reason());

                    if self.config.max_reconnect_attempts > 0
                        && self.failures >= self.config.max_reconnect_attempts
                    {
                        error!(attempts = self.failures, error = %e, "Max reconnection attempts reached");
                        return Err(ChainError::RetriesExhausted(self.failures));
                    }

                    let delay = self.config.backoff.delay(self.failures);
                    warn!(
                        attempt = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        next_block = self.next_block,
                        error = %e,
                        "Chain call failed, retrying"
                    );

                    let event = SourceEvent::Disconnected {
                        reason: e.to_string(),
                        attempt: self.failures,
                    };
                    if !self.emit(event).await || !self.sleep(delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn poll_once(&mut self) -> ChainResult<PollOutcome> {
        let head = with_timeout(self.config.call_timeout, self.client.block_number()).await?;
        Metrics::chain_head(head);

        self.check_continuity(head).await?;

        let safe_head = head.saturating_sub(self.config.confirmations);
        if self.next_block > safe_head {
            debug!(head, safe_head, next_block = self.next_block, "No confirmed blocks to scan");
            if !self.mark_recovered().await {
                return Ok(PollOutcome::Stopped);
            }
            return Ok(PollOutcome::CaughtUp);
        }

        let from_block = self.next_block;
        let span = self.config.max_block_range.max(1) - 1;
        let to_block = safe_head.min(from_block.saturating_add(span));

        let filter = LogFilter {
            address: self.config.pool_address,
            topics: self.topics.clone(),
            from_block,
            to_block,
        };
        let logs = with_timeout(self.config.call_timeout, self.client.get_logs(filter)).await?;
        let tip_hash =
            with_timeout(self.config.call_timeout, self.client.block_hash(to_block)).await?;

        let mut blocks = Vec::new();
        for (block_number, pool_logs) in self.group_by_block(logs, from_block, to_block) {
            let events = self.reader.closing_events(block_number, &pool_logs).await?;
            if !events.is_empty() {
                blocks.push(BlockEvents::new(block_number, events));
            }
        }
        debug!(
            from_block,
            to_block,
            blocks_with_events = blocks.len(),
            "Scanned block range"
        );

        // Nothing below is fallible; the cursor only moves once every block
        // of the range has been handed over.
        if !self.mark_recovered().await {
            return Ok(PollOutcome::Stopped);
        }
        for block in blocks {
            if !self.emit(SourceEvent::Block(block)).await {
                return Ok(PollOutcome::Stopped);
            }
        }
        let progress = SourceEvent::Progress {
            scanned_through: to_block,
            safe_head,
        };
        if !self.emit(progress).await {
            return Ok(PollOutcome::Stopped);
        }

        self.next_block = to_block + 1;
        self.last_scanned = tip_hash.map(|hash| (to_block, hash));

        if to_block < safe_head {
            Ok(PollOutcome::Behind)
        } else {
            Ok(PollOutcome::CaughtUp)
        }
    }

    /// Detect a head regression or a replaced block under the last scanned
    /// height, and rewind when configured to.
    async fn check_continuity(&mut self, head: u64) -> ChainResult<()> {
        let Some((block, hash)) = self.last_scanned else {
            return Ok(());
        };

        if head < block {
            warn!(head, last_scanned = block, "Chain head moved below last scanned block");
            Metrics::discontinuity();
            self.rewind(block);
            return Ok(());
        }

        let current = with_timeout(self.config.call_timeout, self.client.block_hash(block)).await?;
        if current == Some(hash) {
            return Ok(());
        }

        warn!(
            block,
            expected = %hash,
            found = ?current,
            "Scanned block is no longer canonical"
        );
        Metrics::discontinuity();
        self.rewind(block);
        Ok(())
    }

    /// Clear the failure count after a successful poll, telling the
    /// consumer when it follows failures. Returns false on shutdown.
    async fn mark_recovered(&mut self) -> bool {
        if self.failures == 0 {
            return true;
        }
        info!(attempts = self.failures, "Chain connection recovered");
        self.failures = 0;
        self.emit(SourceEvent::Reconnected).await
    }

    fn rewind(&mut self, last_scanned: u64) {
        self.last_scanned = None;
        if !self.config.reorg.rescan_enabled {
            warn!(next_block = self.next_block, "Reorg rescan disabled, continuing forward");
            return;
        }
        let from = last_scanned
            .saturating_sub(self.config.reorg.rescan_depth)
            .saturating_add(1)
            .max(self.floor)
            .min(self.next_block);
        info!(from_block = from, previous_next_block = self.next_block, "Rescanning after reorg");
        self.next_block = from;
    }

    fn group_by_block(
        &self,
        logs: Vec<RawLog>,
        from_block: u64,
        to_block: u64,
    ) -> BTreeMap<u64, Vec<PoolLog>> {
        let mut blocks: BTreeMap<u64, Vec<PoolLog>> = BTreeMap::new();
        for log in logs {
            match decode_pool_log(&log, self.config.pool_address) {
                Ok(decoded) if (from_block..=to_block).contains(&decoded.block_number) => {
                    blocks.entry(decoded.block_number).or_default().push(decoded);
                }
                Ok(decoded) => {
                    warn!(
                        block = decoded.block_number,
                        from_block, to_block, "Skipping log outside requested range"
                    );
                    Metrics::decode_skipped("out_of_range");
                }
                Err(e) => {
                    warn!(
                        block = ?log.block_number,
                        tx = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Skipping undecodable log"
                    );
                    Metrics::decode_skipped(e.reason());
                }
            }
        }
        blocks
    }

    /// Send to the consumer. Returns false on shutdown or a dropped receiver.
    async fn emit(&self, event: SourceEvent) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            res = self.tx.send(event) => res.is_ok(),
        }
    }

    /// Cancellation-aware sleep. Returns false on shutdown.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = self.cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ClosingLogBuilder, MockChainClient, PoolOp};
    use alloy::primitives::U256;
    use std::sync::Arc;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn pool() -> Address {
        Address::repeat_byte(0x42)
    }

    fn test_config() -> SourceConfig {
        SourceConfig {
            pool_address: pool(),
            confirmations: 0,
            max_block_range: 5,
            poll_interval: Duration::from_millis(10),
            call_timeout: Duration::from_secs(1),
            queue_capacity: 4,
            max_reconnect_attempts: 0,
            backoff: BackoffConfig::new(1, 5),
            reorg: ReorgPolicy::default(),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<SourceEvent>) -> SourceEvent {
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("source event timed out")
            .expect("source channel closed")
    }

    /// Collect events until a progress marker reaches `through`.
    async fn collect_through(rx: &mut mpsc::Receiver<SourceEvent>, through: u64) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        loop {
            let event = next(rx).await;
            let done = matches!(
                event,
                SourceEvent::Progress { scanned_through, .. } if scanned_through >= through
            );
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn block_numbers(events: &[SourceEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Block(b) => Some(b.block_number),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_emits_blocks_in_order_with_progress() {
        let mock = Arc::new(MockChainClient::new(20));
        mock.push_op(ClosingLogBuilder::settle(pool(), 12, 3).build());
        mock.push_op(ClosingLogBuilder::liquidate(pool(), 12, 1).build());
        mock.push_op(ClosingLogBuilder::settle(pool(), 15, 0).build());
        mock.push_op(ClosingLogBuilder::settle(pool(), 19, 2).build());

        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock.clone(), test_config(), 10, cancel.clone());

        let events = collect_through(&mut rx, 20).await;
        assert_eq!(block_numbers(&events), vec![12, 15, 19]);

        let SourceEvent::Block(first) = &events[0] else {
            panic!("expected block event first");
        };
        let indices: Vec<u64> = first.events.iter().map(|e| e.log_index).collect();
        assert_eq!(indices, vec![1, 3]);

        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Progress { scanned_through, .. } => Some(*scanned_through),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![14, 19, 20]);
        assert_eq!(mock.log_queries()[..3], [(10, 14), (15, 19), (20, 20)]);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_respects_confirmations() {
        let mock = Arc::new(MockChainClient::new(20));
        mock.push_op(ClosingLogBuilder::settle(pool(), 18, 0).build());

        let config = SourceConfig {
            confirmations: 5,
            max_block_range: 100,
            ..test_config()
        };
        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock.clone(), config, 10, cancel.clone());

        let events = collect_through(&mut rx, 15).await;
        assert!(block_numbers(&events).is_empty());
        assert_eq!(
            events.last(),
            Some(&SourceEvent::Progress {
                scanned_through: 15,
                safe_head: 15
            })
        );

        // Block 18 becomes final once head reaches 23.
        mock.set_head(23);
        let events = collect_through(&mut rx, 18).await;
        assert_eq!(block_numbers(&events), vec![18]);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_retries_from_same_height_after_failures() {
        let mock = Arc::new(MockChainClient::new(12));
        mock.push_op(ClosingLogBuilder::settle(pool(), 10, 0).build());
        mock.fail_next(2);

        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock.clone(), test_config(), 10, cancel.clone());

        assert!(matches!(next(&mut rx).await, SourceEvent::Disconnected { attempt: 1, .. }));
        assert!(matches!(next(&mut rx).await, SourceEvent::Disconnected { attempt: 2, .. }));
        assert_eq!(next(&mut rx).await, SourceEvent::Reconnected);

        let events = collect_through(&mut rx, 12).await;
        assert_eq!(block_numbers(&events), vec![10]);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mock = Arc::new(MockChainClient::new(12));
        mock.fail_next(100);

        let config = SourceConfig {
            max_reconnect_attempts: 3,
            ..test_config()
        };
        let (handle, mut rx) = EventSource::spawn(mock, config, 10, CancellationToken::new());

        // Drain disconnect notices so the producer never blocks on a full queue.
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ChainError::RetriesExhausted(3))));
    }

    #[tokio::test]
    async fn test_persistent_log_failure_escalates_and_exhausts() {
        let mock = Arc::new(MockChainClient::new(100));
        mock.fail_logs(u32::MAX);

        let config = SourceConfig {
            max_reconnect_attempts: 4,
            ..test_config()
        };
        let (handle, mut rx) = EventSource::spawn(mock, config, 10, CancellationToken::new());

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Disconnected { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(!events.contains(&SourceEvent::Reconnected));

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ChainError::RetriesExhausted(4))));
    }

    #[tokio::test]
    async fn test_state_read_failure_retries_whole_range() {
        let mock = Arc::new(MockChainClient::new(12));
        mock.push_op(PoolOp::mint(pool(), 10, 0, 300));
        mock.push_op(
            ClosingLogBuilder::liquidate(pool(), 10, 1)
                .liquidity(1000, 950)
                .build(),
        );
        mock.push_op(ClosingLogBuilder::settle(pool(), 11, 0).build());
        mock.fail_calls(2);

        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock.clone(), test_config(), 10, cancel.clone());

        assert!(matches!(next(&mut rx).await, SourceEvent::Disconnected { attempt: 1, .. }));
        assert!(matches!(next(&mut rx).await, SourceEvent::Disconnected { attempt: 2, .. }));
        assert_eq!(next(&mut rx).await, SourceEvent::Reconnected);

        let events = collect_through(&mut rx, 12).await;
        assert_eq!(block_numbers(&events), vec![10, 11]);
        let SourceEvent::Block(first) = &events[0] else {
            panic!("expected block event first");
        };
        assert_eq!(first.events.len(), 1);
        assert_eq!(first.events[0].liquidity_locked, U256::from(1000u64));
        assert_eq!(first.events[0].liquidity_returned, U256::from(950u64));
        assert!(mock.log_queries().iter().all(|&(from, _)| from == 10));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_blocks_without_closes_are_not_emitted() {
        let mock = Arc::new(MockChainClient::new(14));
        mock.push_op(PoolOp::mint(pool(), 11, 0, 10));
        mock.push_op(PoolOp::swap(pool(), 12, 0, 5_000));
        mock.push_op(ClosingLogBuilder::settle(pool(), 13, 0).build());

        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock, test_config(), 10, cancel.clone());

        let events = collect_through(&mut rx, 14).await;
        assert_eq!(block_numbers(&events), vec![13]);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_skips_undecodable_logs() {
        let mock = Arc::new(MockChainClient::new(14));
        let mut broken = ClosingLogBuilder::settle(pool(), 11, 0)
            .build()
            .render(U256::ZERO);
        broken.data.truncate(7);
        mock.push_log(broken);
        mock.push_op(ClosingLogBuilder::liquidate(pool(), 13, 0).build());

        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock, test_config(), 10, cancel.clone());

        let events = collect_through(&mut rx, 14).await;
        assert_eq!(block_numbers(&events), vec![13]);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_rescans_after_reorg() {
        let mock = Arc::new(MockChainClient::new(20));
        mock.push_op(ClosingLogBuilder::settle(pool(), 18, 0).build());

        let config = SourceConfig {
            max_block_range: 100,
            reorg: ReorgPolicy {
                rescan_enabled: true,
                rescan_depth: 5,
            },
            ..test_config()
        };
        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock.clone(), config, 10, cancel.clone());

        let events = collect_through(&mut rx, 20).await;
        assert_eq!(block_numbers(&events), vec![18]);

        // Replace block 20 and advance the head: blocks 16..=20 are scanned again.
        mock.set_block_hash(20, B256::repeat_byte(0xee));
        mock.set_head(21);
        let events = collect_through(&mut rx, 21).await;
        assert_eq!(block_numbers(&events), vec![18]);
        assert!(mock.log_queries().iter().any(|&(from, _)| from == 16));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reorg_without_rescan_moves_forward() {
        let mock = Arc::new(MockChainClient::new(20));
        let config = SourceConfig {
            max_block_range: 100,
            reorg: ReorgPolicy {
                rescan_enabled: false,
                rescan_depth: 5,
            },
            ..test_config()
        };
        let cancel = CancellationToken::new();
        let (handle, mut rx) = EventSource::spawn(mock.clone(), config, 10, cancel.clone());
        collect_through(&mut rx, 20).await;

        mock.set_block_hash(20, B256::repeat_byte(0xee));
        mock.set_head(22);
        collect_through(&mut rx, 22).await;
        assert!(mock.log_queries().contains(&(21, 22)));
        assert!(!mock.log_queries().iter().any(|&(from, _)| from < 21 && from > 10));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_while_queue_full() {
        let mock = Arc::new(MockChainClient::new(100));
        for block in 1..=20 {
            mock.push_op(ClosingLogBuilder::settle(pool(), block, 0).build());
        }
        let config = SourceConfig {
            queue_capacity: 1,
            ..test_config()
        };
        let cancel = CancellationToken::new();
        let (handle, _rx) = EventSource::spawn(mock, config, 1, cancel.clone());

        // Producer blocks on the full queue; cancellation must still stop it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
