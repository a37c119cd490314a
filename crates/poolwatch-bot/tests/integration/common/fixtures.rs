//! Monitor harness over in-memory collaborators.

use alloy::primitives::Address;
use poolwatch_alert::{DispatchConfig, DynNotifier, MockNotifier};
use poolwatch_bot::{AppResult, MonitorConfig, MonitorContext, MonitorLoop, MonitorReport, MonitorState};
use poolwatch_chain::{ClosingLogBuilder, MockChainClient, PoolOp, ReorgPolicy, SourceConfig};
use poolwatch_core::BackoffConfig;
use poolwatch_persistence::{MemoryCheckpointStore, MemoryDeliveryLog};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn pool() -> Address {
    Address::repeat_byte(0x42)
}

pub fn owner() -> Address {
    Address::repeat_byte(0x07)
}

/// Liquidation of position `(owner(), id)`.
pub fn liquidation(block: u64, log_index: u64, id: u64, locked: u64, returned: u64) -> PoolOp {
    ClosingLogBuilder::liquidate(pool(), block, log_index)
        .position(owner(), id)
        .liquidity(locked, returned)
        .build()
}

/// Settlement of position `(owner(), id)`.
pub fn settlement(block: u64, log_index: u64, id: u64, locked: u64, returned: u64) -> PoolOp {
    ClosingLogBuilder::settle(pool(), block, log_index)
        .position(owner(), id)
        .liquidity(locked, returned)
        .build()
}

/// Monitor configuration with millisecond timings.
pub fn fast_config() -> MonitorConfig {
    MonitorConfig {
        source: SourceConfig {
            pool_address: pool(),
            confirmations: 0,
            max_block_range: 100,
            poll_interval: Duration::from_millis(10),
            call_timeout: Duration::from_secs(1),
            queue_capacity: 8,
            max_reconnect_attempts: 0,
            backoff: BackoffConfig::new(1, 5),
            reorg: ReorgPolicy::default(),
        },
        dispatch: DispatchConfig {
            max_retries: 0,
            backoff: BackoffConfig::new(1, 2),
            call_timeout: Duration::from_millis(500),
            explorer_url: None,
        },
        redelivery_backoff: BackoffConfig::new(5, 20),
        accept_alert_loss_through: None,
    }
}

/// Mocks plus handles that stay valid while the monitor owns the stores.
pub struct Harness {
    pub chain: Arc<MockChainClient>,
    pub notifier: Arc<MockNotifier>,
    pub checkpoint: MemoryCheckpointStore,
    pub delivery_log: MemoryDeliveryLog,
    pub alerts_enabled: bool,
}

impl Harness {
    pub fn new(head: u64, last_processed: u64) -> Self {
        Self {
            chain: Arc::new(MockChainClient::new(head)),
            notifier: Arc::new(MockNotifier::new()),
            checkpoint: MemoryCheckpointStore::new(last_processed),
            delivery_log: MemoryDeliveryLog::new(),
            alerts_enabled: true,
        }
    }

    pub fn monitor(&self, config: MonitorConfig) -> MonitorLoop {
        let notifier = self
            .alerts_enabled
            .then(|| self.notifier.clone() as DynNotifier);
        MonitorLoop::new(
            config,
            MonitorContext {
                chain: self.chain.clone(),
                notifier,
                checkpoint: Box::new(self.checkpoint.clone()),
                delivery_log: Box::new(self.delivery_log.clone()),
            },
        )
    }

    pub fn spawn(&self, config: MonitorConfig) -> RunningMonitor {
        let monitor = self.monitor(config);
        let state = monitor.subscribe_state();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));
        RunningMonitor {
            handle,
            cancel,
            state,
        }
    }
}

pub struct RunningMonitor {
    pub handle: JoinHandle<AppResult<MonitorReport>>,
    pub cancel: CancellationToken,
    pub state: watch::Receiver<MonitorState>,
}

impl RunningMonitor {
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Request shutdown and wait for the report.
    pub async fn stop(self) -> AppResult<MonitorReport> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the monitor to finish on its own.
    pub async fn join(self) -> AppResult<MonitorReport> {
        tokio::time::timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("monitor did not stop in time")
            .expect("monitor task panicked")
    }
}

/// Poll `condition` until it holds, panicking with `what` on timeout.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
