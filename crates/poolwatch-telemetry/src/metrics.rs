//! Prometheus metrics for the pool watcher.
//!
//! Covers:
//! - Chain ingestion (head, reconnects, decode skips, discontinuities)
//! - Invariant evaluation (events, breaches)
//! - Alert delivery (outcomes, attempts)
//! - Monitor progress (checkpoint, state machine)
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A failure means duplicate metric
//! names, which is a programming error that should crash at first use.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, GaugeVec, IntCounter, IntGauge, TextEncoder,
};

/// Closing events evaluated.
/// Labels: kind (settled/liquidated)
pub static EVENTS_EVALUATED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "poolwatch_events_evaluated_total",
        "Total closing events evaluated against the solvency invariant",
        &["kind"]
    )
    .unwrap()
});

/// Invariant breaches detected.
/// Labels: kind (settled/liquidated)
pub static BREACHES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "poolwatch_breaches_total",
        "Total closing events that returned less liquidity than locked",
        &["kind"]
    )
    .unwrap()
});

/// Alert dispatch outcomes.
/// Labels: outcome (delivered/duplicate/disabled/exhausted/abandoned)
pub static ALERTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "poolwatch_alerts_total",
        "Breach alert dispatch outcomes",
        &["outcome"]
    )
    .unwrap()
});

/// Failed notification channel calls (each retry counts).
pub static ALERT_SEND_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "poolwatch_alert_send_failures_total",
        "Failed notification channel calls"
    )
    .unwrap()
});

/// Logs skipped because they could not be decoded.
/// Labels: reason
pub static DECODE_SKIPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "poolwatch_decode_skipped_total",
        "Pool logs skipped as malformed",
        &["reason"]
    )
    .unwrap()
});

/// Chain RPC reconnect attempts.
/// Labels: reason (timeout/transport/rpc)
pub static CHAIN_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "poolwatch_chain_reconnect_total",
        "Chain RPC retry attempts after transient failures",
        &["reason"]
    )
    .unwrap()
});

/// Detected chain discontinuities (reorg or provider head regression).
pub static DISCONTINUITIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "poolwatch_chain_discontinuities_total",
        "Detected reorgs or head regressions"
    )
    .unwrap()
});

/// Latest chain head seen.
pub static CHAIN_HEAD: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("poolwatch_chain_head", "Latest chain head block number").unwrap()
});

/// Persisted checkpoint height.
pub static CHECKPOINT_BLOCK: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "poolwatch_checkpoint_block",
        "Last fully processed block number"
    )
    .unwrap()
});

/// Monitor state machine current state.
/// Labels: state (starting/catching_up/live/reconnecting/stopped)
pub static MONITOR_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "poolwatch_monitor_state",
        "Monitor state machine current state (1=active, 0=inactive)",
        &["state"]
    )
    .unwrap()
});

const MONITOR_STATES: [&str; 5] = ["starting", "catching_up", "live", "reconnecting", "stopped"];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Record an evaluated closing event.
    pub fn event_evaluated(kind: &str) {
        EVENTS_EVALUATED_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Record an invariant breach.
    pub fn breach_detected(kind: &str) {
        BREACHES_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Record an alert dispatch outcome.
    pub fn alert_outcome(outcome: &str) {
        ALERTS_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Record a failed notification channel call.
    pub fn alert_send_failed() {
        ALERT_SEND_FAILURES_TOTAL.inc();
    }

    /// Record a skipped, undecodable log.
    pub fn decode_skipped(reason: &str) {
        DECODE_SKIPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record a chain retry after a transient failure.
    pub fn chain_reconnect(reason: &str) {
        CHAIN_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record a detected reorg or head regression.
    pub fn discontinuity() {
        DISCONTINUITIES_TOTAL.inc();
    }

    pub fn chain_head(block: u64) {
        CHAIN_HEAD.set(block as i64);
    }

    pub fn checkpoint(block: u64) {
        CHECKPOINT_BLOCK.set(block as i64);
    }

    /// Set the monitor state. Only the active state is 1.
    pub fn monitor_state_set(state: &str) {
        for s in &MONITOR_STATES {
            MONITOR_STATE.with_label_values(&[s]).set(0.0);
        }
        MONITOR_STATE.with_label_values(&[state]).set(1.0);
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn gather_text() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
