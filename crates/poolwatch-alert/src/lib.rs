//! Breach alert dispatch.
//!
//! Formats a breached [`poolwatch_core::InvariantVerdict`] into an operator
//! message, sends it over a [`Notifier`] with bounded retry, and records the
//! outcome in the delivery log so an alert key is delivered at most once.

pub mod dispatcher;
pub mod error;
pub mod message;
pub mod notifier;
pub mod telegram;

pub use dispatcher::{AlertDispatcher, DispatchConfig, DispatchOutcome};
pub use error::{AlertError, AlertResult};
pub use message::format_alert;
pub use notifier::{DynNotifier, MockNotifier, Notifier};
pub use telegram::TelegramNotifier;
