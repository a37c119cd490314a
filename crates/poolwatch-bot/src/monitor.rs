//! Monitor loop: consumes chain events, checks the solvency invariant,
//! dispatches breach alerts and advances the checkpoint.
//!
//! Per block, in order:
//! 1. Evaluate every event (log-index order)
//! 2. Dispatch breach alerts in the same order, stopping at the first one
//!    that cannot be delivered
//! 3. Advance the checkpoint only when every alert of the block was
//!    delivered or deduplicated, alerting is disabled, or the block is
//!    covered by the loss override and its failed alerts were abandoned
//!
//! A block whose alert cannot be delivered holds the checkpoint and is
//! retried with backoff; the bounded event queue pauses the producer
//! meanwhile.

use crate::error::{AppError, AppResult};
use poolwatch_alert::{AlertDispatcher, AlertError, DispatchConfig, DispatchOutcome, DynNotifier};
use poolwatch_chain::{DynChainClient, EventSource, SourceConfig, SourceEvent};
use poolwatch_core::{evaluate, BackoffConfig, BlockEvents, InvariantVerdict};
use poolwatch_persistence::{CheckpointStore, DeliveryLog};
use poolwatch_telemetry::Metrics;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Starting,
    /// Confirmed blocks remain to be scanned.
    CatchingUp,
    /// Scanned through the confirmed head.
    Live,
    /// Chain unreachable or an alert is blocked on delivery.
    Reconnecting,
    Stopped,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Starting => "starting",
            MonitorState::CatchingUp => "catching_up",
            MonitorState::Live => "live",
            MonitorState::Reconnecting => "reconnecting",
            MonitorState::Stopped => "stopped",
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub source: SourceConfig,
    pub dispatch: DispatchConfig,
    /// Backoff between dispatch rounds of a block blocked on delivery.
    pub redelivery_backoff: BackoffConfig,
    /// Operator override: blocks at or below this height may be
    /// checkpointed with undelivered alerts.
    pub accept_alert_loss_through: Option<u64>,
}

/// Collaborators owned by the monitor.
pub struct MonitorContext {
    pub chain: DynChainClient,
    /// `None` disables alert sending.
    pub notifier: Option<DynNotifier>,
    pub checkpoint: Box<dyn CheckpointStore>,
    pub delivery_log: Box<dyn DeliveryLog>,
}

/// Counters reported when the monitor stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub blocks_processed: u64,
    pub events_evaluated: u64,
    pub breaches: u64,
    pub alerts_delivered: u64,
    pub duplicates_skipped: u64,
    pub alerts_abandoned: u64,
    pub final_checkpoint: u64,
}

/// Single consumer of the chain event stream.
pub struct MonitorLoop {
    config: MonitorConfig,
    chain: DynChainClient,
    checkpoint: Box<dyn CheckpointStore>,
    dispatcher: AlertDispatcher,
    state_tx: watch::Sender<MonitorState>,
    report: MonitorReport,
}

impl MonitorLoop {
    pub fn new(config: MonitorConfig, ctx: MonitorContext) -> Self {
        let dispatcher =
            AlertDispatcher::new(ctx.notifier, ctx.delivery_log, config.dispatch.clone());
        let (state_tx, _) = watch::channel(MonitorState::Starting);
        Metrics::monitor_state_set(MonitorState::Starting.as_str());

        Self {
            config,
            chain: ctx.chain,
            checkpoint: ctx.checkpoint,
            dispatcher,
            state_tx,
            report: MonitorReport::default(),
        }
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// Fatal: checkpoint or delivery log write failure, and the event source
    /// giving up after its retry budget.
    pub async fn run(mut self, cancel: CancellationToken) -> AppResult<MonitorReport> {
        let start_block = self.checkpoint.get().saturating_add(1);
        info!(
            start_block,
            alerts_enabled = self.dispatcher.is_enabled(),
            accept_alert_loss_through = ?self.config.accept_alert_loss_through,
            "Monitor starting"
        );
        Metrics::checkpoint(self.checkpoint.get());
        self.set_state(MonitorState::CatchingUp);

        let source_cancel = cancel.child_token();
        let (source_handle, mut rx) = EventSource::spawn(
            self.chain.clone(),
            self.config.source.clone(),
            start_block,
            source_cancel.clone(),
        );

        let consumed = self.consume(&mut rx, &cancel).await;

        source_cancel.cancel();
        drop(rx);
        let source_result = source_handle.await;
        self.set_state(MonitorState::Stopped);

        consumed?;
        match source_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Chain event source failed");
                return Err(AppError::Chain(e));
            }
            Err(e) => return Err(AppError::SourceTerminated(e.to_string())),
        }

        self.report.final_checkpoint = self.checkpoint.get();
        info!(report = ?self.report, "Monitor stopped");
        Ok(self.report)
    }

    async fn consume(
        &mut self,
        rx: &mut mpsc::Receiver<SourceEvent>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Shutdown requested, stopping monitor");
                    return Ok(());
                }
                event = rx.recv() => event,
            };

            let Some(event) = event else {
                debug!("Event source closed");
                return Ok(());
            };

            match event {
                SourceEvent::Block(block) => {
                    if !self.process_block(block, cancel).await? {
                        return Ok(());
                    }
                }
                SourceEvent::Progress {
                    scanned_through,
                    safe_head,
                } => {
                    self.advance_checkpoint(scanned_through)?;
                    if scanned_through >= safe_head {
                        self.set_state(MonitorState::Live);
                    } else {
                        self.set_state(MonitorState::CatchingUp);
                    }
                }
                SourceEvent::Disconnected { reason, attempt } => {
                    warn!(attempt, reason = %reason, "Chain connection lost");
                    self.set_state(MonitorState::Reconnecting);
                }
                SourceEvent::Reconnected => {
                    info!("Chain connection restored");
                    self.set_state(MonitorState::CatchingUp);
                }
            }
        }
    }

    /// Returns false when shutdown interrupted alert redelivery; the block
    /// is then left unprocessed.
    async fn process_block(
        &mut self,
        block: BlockEvents,
        cancel: &CancellationToken,
    ) -> AppResult<bool> {
        let verdicts: Vec<InvariantVerdict> = block.events.iter().map(evaluate).collect();

        for verdict in &verdicts {
            let event = &verdict.event;
            Metrics::event_evaluated(event.kind.as_str());
            self.report.events_evaluated += 1;
            if verdict.breached {
                Metrics::breach_detected(event.kind.as_str());
                self.report.breaches += 1;
                error!(
                    kind = %event.kind,
                    position = %event.position_id,
                    block = event.block_number,
                    log_index = event.log_index,
                    locked = %event.liquidity_locked,
                    returned = %event.liquidity_returned,
                    deficit = %verdict.deficit,
                    "Pool {} on position {} lost liquidity: {}",
                    event.kind,
                    event.position_id,
                    verdict.deficit
                );
            }
        }

        let mut round = 0u32;
        let accept_loss = self.loss_accepted(block.block_number);
        loop {
            match self.dispatch_block(&verdicts, accept_loss).await {
                Ok(()) => break,
                Err(AlertError::DeliveryExhausted { key, .. }) => {
                    round += 1;
                    self.set_state(MonitorState::Reconnecting);
                    let delay = self.config.redelivery_backoff.delay(round);
                    warn!(
                        block = block.block_number,
                        alert_key = %key,
                        round,
                        delay_ms = delay.as_millis() as u64,
                        "Alert delivery blocked, holding checkpoint"
                    );

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            warn!(
                                block = block.block_number,
                                "Shutdown during alert redelivery, block will be reprocessed on restart"
                            );
                            return Ok(false);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        if round > 0 {
            self.set_state(MonitorState::CatchingUp);
        }

        self.advance_checkpoint(block.block_number)?;
        self.report.blocks_processed += 1;
        debug!(
            block = block.block_number,
            events = block.len(),
            "Block processed"
        );
        Ok(true)
    }

    /// Dispatch the block's breach alerts in order.
    ///
    /// With `accept_loss` an alert that cannot be delivered is abandoned and
    /// the following ones are still attempted. Otherwise the first such
    /// alert stops the block.
    async fn dispatch_block(
        &mut self,
        verdicts: &[InvariantVerdict],
        accept_loss: bool,
    ) -> Result<(), AlertError> {
        for verdict in verdicts.iter().filter(|v| v.breached) {
            match self.dispatcher.dispatch(verdict).await {
                Ok(DispatchOutcome::Delivered { .. }) => self.report.alerts_delivered += 1,
                Ok(DispatchOutcome::Duplicate) => self.report.duplicates_skipped += 1,
                Ok(DispatchOutcome::Disabled | DispatchOutcome::NotBreached) => {}
                Err(AlertError::DeliveryExhausted { .. }) if accept_loss => {
                    self.dispatcher.accept_loss(verdict)?;
                    self.report.alerts_abandoned += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn loss_accepted(&self, block_number: u64) -> bool {
        self.config
            .accept_alert_loss_through
            .is_some_and(|through| block_number <= through)
    }

    /// Move the checkpoint forward. Heights at or below the current one
    /// (rescanned blocks) leave it untouched.
    fn advance_checkpoint(&mut self, height: u64) -> AppResult<()> {
        if height <= self.checkpoint.get() {
            return Ok(());
        }
        self.checkpoint.set(height).map_err(|e| {
            error!(height, error = %e, "Checkpoint write failed");
            e
        })?;
        Metrics::checkpoint(height);
        Ok(())
    }

    fn set_state(&self, state: MonitorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = previous.as_str(), to = state.as_str(), "Monitor state changed");
            Metrics::monitor_state_set(state.as_str());
        }
    }
}
