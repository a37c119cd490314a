//! Solvency invariant: liquidity returned on close must cover liquidity locked.

use alloy::primitives::U256;

use crate::alert_key::AlertKey;
use crate::event::ClosingEvent;

/// Outcome of checking one closing event.
///
/// Derived from the event alone and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantVerdict {
    pub event: ClosingEvent,
    pub breached: bool,
    /// `liquidity_locked - liquidity_returned` when breached, zero otherwise.
    pub deficit: U256,
}

impl InvariantVerdict {
    pub fn alert_key(&self) -> AlertKey {
        self.event.alert_key()
    }
}

/// Check `liquidity_returned >= liquidity_locked` for a closing event.
///
/// Pure: no state, no I/O, same input gives the same verdict.
pub fn evaluate(event: &ClosingEvent) -> InvariantVerdict {
    let breached = event.liquidity_returned < event.liquidity_locked;
    let deficit = if breached {
        event.liquidity_locked - event.liquidity_returned
    } else {
        U256::ZERO
    };

    InvariantVerdict {
        event: event.clone(),
        breached,
        deficit,
    }
}
