//! Application bootstrap.
//!
//! Wires the JSON-RPC client, the notifier and the on-disk state into a
//! [`MonitorLoop`] and runs it until Ctrl-C.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::monitor::{MonitorContext, MonitorLoop, MonitorReport};
use poolwatch_chain::{ChainError, DynChainClient, RpcClient};
use poolwatch_core::BackoffConfig;
use poolwatch_persistence::{FileCheckpointStore, JsonLinesDeliveryLog};
use poolwatch_telemetry::Metrics;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Checkpoint file name inside the data directory.
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Delivery log file name inside the data directory.
pub const DELIVERY_LOG_FILE: &str = "alerts.jsonl";

/// Main application.
pub struct Application {
    config: AppConfig,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run until Ctrl-C or a fatal error.
    pub async fn run(self) -> AppResult<MonitorReport> {
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                signal_cancel.cancel();
            }
        });

        self.run_until(cancel).await
    }

    /// Run until `cancel` fires or a fatal error.
    pub async fn run_until(self, cancel: CancellationToken) -> AppResult<MonitorReport> {
        let monitor_config = self.config.monitor_config()?;
        let source = &monitor_config.source;

        let chain: DynChainClient = Arc::new(RpcClient::new(
            self.config.chain.rpc_url.as_str(),
            source.call_timeout,
        )?);
        let notifier = self.config.build_notifier()?;

        let data_dir = PathBuf::from(&self.config.persistence.data_dir);
        let checkpoint_path = data_dir.join(CHECKPOINT_FILE);

        let default_height = match FileCheckpointStore::load(&checkpoint_path)? {
            Some(checkpoint) => checkpoint.last_processed_block,
            None => {
                let initial = initial_checkpoint(
                    self.config.chain.start_block,
                    &chain,
                    source.call_timeout,
                    source.backoff,
                    source.max_reconnect_attempts,
                    &cancel,
                )
                .await?;
                match initial {
                    Some(height) => height,
                    None => {
                        info!("Shutdown requested before the first checkpoint was known");
                        return Ok(MonitorReport::default());
                    }
                }
            }
        };

        let checkpoint = FileCheckpointStore::open(checkpoint_path, default_height)?;
        let delivery_log = JsonLinesDeliveryLog::open(data_dir.join(DELIVERY_LOG_FILE))?;

        info!(
            pool = %source.pool_address,
            rpc_url = %self.config.chain.rpc_url,
            data_dir = %data_dir.display(),
            last_processed_block = default_height,
            "Application initialized"
        );

        let monitor = MonitorLoop::new(
            monitor_config,
            MonitorContext {
                chain,
                notifier,
                checkpoint: Box::new(checkpoint),
                delivery_log: Box::new(delivery_log),
            },
        );
        let report = monitor.run(cancel).await?;

        match Metrics::gather_text() {
            Ok(text) => debug!(metrics = %text, "Final metrics snapshot"),
            Err(e) => warn!(error = %e, "Failed to gather metrics"),
        }

        Ok(report)
    }
}

/// Last processed height to assume when no checkpoint exists.
///
/// `start_block - 1` when a start block is configured; otherwise the current
/// chain head, so only new blocks are watched. The head is fetched with the
/// chain backoff policy. `None` if shutdown was requested meanwhile.
pub async fn initial_checkpoint(
    start_block: Option<u64>,
    chain: &DynChainClient,
    call_timeout: Duration,
    backoff: BackoffConfig,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> AppResult<Option<u64>> {
    if let Some(start) = start_block {
        info!(start_block = start, "No checkpoint found, starting at configured block");
        return Ok(Some(start.saturating_sub(1)));
    }

    let mut attempt = 0u32;
    loop {
        let error = match tokio::time::timeout(call_timeout, chain.block_number()).await {
            Ok(Ok(head)) => {
                info!(head, "No checkpoint or start block, watching from chain head");
                return Ok(Some(head));
            }
            Ok(Err(e)) => e,
            Err(_) => ChainError::Timeout(call_timeout),
        };

        attempt += 1;
        if max_attempts > 0 && attempt >= max_attempts {
            return Err(AppError::Chain(ChainError::RetriesExhausted(attempt)));
        }

        let delay = backoff.delay(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Failed to read chain head, retrying"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolwatch_chain::MockChainClient;

    fn mock(head: u64) -> (Arc<MockChainClient>, DynChainClient) {
        let mock = Arc::new(MockChainClient::new(head));
        let chain: DynChainClient = mock.clone();
        (mock, chain)
    }

    #[tokio::test]
    async fn test_initial_checkpoint_from_start_block() {
        let (_, chain) = mock(500);
        let height = initial_checkpoint(
            Some(100),
            &chain,
            Duration::from_secs(1),
            BackoffConfig::new(1, 2),
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(height, Some(99));
    }

    #[tokio::test]
    async fn test_initial_checkpoint_from_head_after_failures() {
        let (mock, chain) = mock(500);
        mock.fail_next(2);
        let height = initial_checkpoint(
            None,
            &chain,
            Duration::from_secs(1),
            BackoffConfig::new(1, 2),
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(height, Some(500));
    }

    #[tokio::test]
    async fn test_initial_checkpoint_gives_up() {
        let (mock, chain) = mock(500);
        mock.fail_next(10);
        let result = initial_checkpoint(
            None,
            &chain,
            Duration::from_secs(1),
            BackoffConfig::new(1, 2),
            3,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(AppError::Chain(ChainError::RetriesExhausted(3)))
        ));
    }

    #[tokio::test]
    async fn test_initial_checkpoint_cancelled() {
        let (mock, chain) = mock(500);
        mock.fail_next(u32::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = initial_checkpoint(
            None,
            &chain,
            Duration::from_secs(1),
            BackoffConfig::new(1000, 2000),
            0,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        assert!(matches!(
            Application::new(AppConfig::default()),
            Err(AppError::Config(_))
        ));
    }
}
