//! A single cancellation token rooted at the service, shared by the
//! control loop and the IPC endpoint.
//!
//! Modeled as an `AtomicBool` paired with a `tokio::sync::Notify` rather than
//! pulling in `tokio-util` for a single type.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub struct CancellationToken {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { cancelled: AtomicBool::new(false), notify: Notify::new() }
    }

    /// Signals cancellation and wakes every task currently waiting on
    /// `cancelled()`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been signalled. Safe to call after
    /// `cancel()` already fired: the `Notified` future is constructed
    /// before the flag check below, so a `cancel()` landing in between
    /// still wakes this waiter instead of racing past `notify_waiters()`.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
