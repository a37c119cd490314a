//! Deduplicated alert dispatch with bounded retry.

use crate::error::{AlertError, AlertResult};
use crate::message::format_alert;
use crate::notifier::DynNotifier;
use poolwatch_core::{AlertKey, BackoffConfig, InvariantVerdict};
use poolwatch_persistence::{DeliveryLog, DeliveryRecord, DeliveryStatus};
use poolwatch_telemetry::Metrics;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Bound on each send.
    pub call_timeout: Duration,
    pub explorer_url: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffConfig::new(1000, 30_000),
            call_timeout: Duration::from_millis(10_000),
            explorer_url: None,
        }
    }
}

/// Result of dispatching one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Invariant held; nothing to send.
    NotBreached,
    /// Already delivered earlier.
    Duplicate,
    /// No notification channel configured; the breach was only logged.
    Disabled,
    /// Accepted by the channel and recorded.
    Delivered { attempts: u32 },
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::NotBreached => "not_breached",
            DispatchOutcome::Duplicate => "duplicate",
            DispatchOutcome::Disabled => "disabled",
            DispatchOutcome::Delivered { .. } => "delivered",
        }
    }
}

/// Sends breach alerts at most once per [`poolwatch_core::AlertKey`].
pub struct AlertDispatcher {
    notifier: Option<DynNotifier>,
    log: Box<dyn DeliveryLog>,
    config: DispatchConfig,
    /// Keys with a `Failed` record written by this process.
    failure_recorded: HashSet<AlertKey>,
}

impl AlertDispatcher {
    /// `notifier = None` disables sending; breaches are still logged.
    pub fn new(
        notifier: Option<DynNotifier>,
        log: Box<dyn DeliveryLog>,
        config: DispatchConfig,
    ) -> Self {
        if notifier.is_none() {
            warn!("No notification channel configured, breach alerts will only be logged");
        }
        Self {
            notifier,
            log,
            config,
            failure_recorded: HashSet::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    pub fn is_delivered(&self, key: &AlertKey) -> bool {
        self.log.is_delivered(key)
    }

    /// Dispatch the alert for `verdict`.
    ///
    /// A `Delivered` record is durable before this returns success. When
    /// every attempt fails [`AlertError::DeliveryExhausted`] is returned and
    /// the caller decides when to try again. Only the first exhausted round
    /// of a key writes a `Failed` record, so a long outage does not grow the
    /// log.
    pub async fn dispatch(&mut self, verdict: &InvariantVerdict) -> AlertResult<DispatchOutcome> {
        if !verdict.breached {
            return Ok(DispatchOutcome::NotBreached);
        }

        let event = &verdict.event;
        let key = verdict.alert_key();

        if self.log.is_delivered(&key) {
            debug!(alert_key = %key, block = event.block_number, "Alert already delivered, skipping");
            Metrics::alert_outcome("duplicate");
            return Ok(DispatchOutcome::Duplicate);
        }

        let Some(notifier) = self.notifier.clone() else {
            error!(
                alert_key = %key,
                kind = %event.kind,
                position = %event.position_id,
                block = event.block_number,
                tx = %event.transaction_hash,
                deficit = %verdict.deficit,
                "Pool invariant breached (alerting disabled)"
            );
            Metrics::alert_outcome("disabled");
            return Ok(DispatchOutcome::Disabled);
        };

        let text = format_alert(verdict, self.config.explorer_url.as_deref());
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let send = notifier.send(text.clone());
            let result = match tokio::time::timeout(self.config.call_timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(AlertError::Timeout(self.config.call_timeout)),
            };

            match result {
                Ok(()) => {
                    let record =
                        DeliveryRecord::new(verdict, DeliveryStatus::Delivered, attempt, None);
                    self.log.record(record)?;
                    Metrics::alert_outcome("delivered");
                    info!(
                        alert_key = %key,
                        position = %event.position_id,
                        block = event.block_number,
                        attempts = attempt,
                        "Breach alert delivered"
                    );
                    return Ok(DispatchOutcome::Delivered { attempts: attempt });
                }
                Err(e) => {
                    Metrics::alert_send_failed();
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.config.backoff.delay(attempt);
                        warn!(
                            alert_key = %key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Alert send failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        if !self.failure_recorded.contains(&key) {
            self.log.record(DeliveryRecord::new(
                verdict,
                DeliveryStatus::Failed,
                max_attempts,
                Some(last_error.clone()),
            ))?;
            self.failure_recorded.insert(key);
        }
        Metrics::alert_outcome("exhausted");
        error!(
            alert_key = %key,
            position = %event.position_id,
            block = event.block_number,
            attempts = max_attempts,
            error = %last_error,
            "Breach alert delivery exhausted"
        );

        Err(AlertError::DeliveryExhausted {
            key,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Record that the operator accepted losing this alert.
    pub fn accept_loss(&mut self, verdict: &InvariantVerdict) -> AlertResult<()> {
        let key = verdict.alert_key();
        self.log.record(DeliveryRecord::new(
            verdict,
            DeliveryStatus::Abandoned,
            0,
            Some("alert loss accepted by operator".to_string()),
        ))?;
        Metrics::alert_outcome("abandoned");
        warn!(
            alert_key = %key,
            block = verdict.event.block_number,
            "Undelivered alert abandoned by operator override"
        );
        Ok(())
    }
}
