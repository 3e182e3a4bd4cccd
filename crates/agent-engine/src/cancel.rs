//! One-shot cancel flag shared between the state machine and its workers.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Setting the flag is non-blocking; workers observe it either by polling
/// [`CancelFlag::is_set`] at safe points or by awaiting
/// [`CancelFlag::cancelled`] inside a timed wait.
#[derive(Debug, Default)]
pub struct CancelFlag {
    flagged: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn set(&self) {
        if !self.flagged.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_set(&self) -> bool {
        self.flagged.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set. Safe against the set() racing the
    /// registration of the waiter.
    pub async fn cancelled(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
