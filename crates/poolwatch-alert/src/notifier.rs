//! Notification channel abstraction.

use crate::error::{AlertError, AlertResult};
use parking_lot::Mutex;
use poolwatch_core::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Delivers one operator message.
///
/// `Ok(())` means the channel accepted the message.
pub trait Notifier: Send + Sync {
    fn send(&self, text: String) -> BoxFuture<'_, AlertResult<()>>;
}

pub type DynNotifier = Arc<dyn Notifier>;

/// Mock notifier for testing.
#[derive(Debug, Default)]
pub struct MockNotifier {
    sends: Mutex<Vec<String>>,
    fail_next: Mutex<u32>,
    delay: Mutex<Duration>,
    attempts: Mutex<u32>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends.
    pub fn fail_next(&self, n: u32) {
        *self.fail_next.lock() = n;
    }

    /// Delay every send, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<String> {
        self.sends.lock().clone()
    }

    /// Send calls made so far, successful or not.
    pub fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }
}

impl Notifier for MockNotifier {
    fn send(&self, text: String) -> BoxFuture<'_, AlertResult<()>> {
        Box::pin(async move {
            *self.attempts.lock() += 1;
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let failing = {
                let mut fail_next = self.fail_next.lock();
                let failing = *fail_next > 0;
                if failing {
                    *fail_next -= 1;
                }
                failing
            };
            if failing {
                return Err(AlertError::Transport("mock notifier failure".to_string()));
            }

            self.sends.lock().push(text);
            Ok(())
        })
    }
}
