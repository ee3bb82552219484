//! The "started" signal from spec §4.6 step 5: closes exactly once after
//! the first successful NNC reconcile. Callers may either poll it (the
//! `/readyz` probe) or block on it (serving pod IPAM traffic only once the
//! node's NC state is known).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Default)]
pub struct StartedSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl StartedSignal {
    pub fn mark(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_started(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Checks the flag before awaiting, so a `mark()` that happened before
    /// this call isn't missed.
    pub async fn wait(&self) {
        if self.is_started() {
            return;
        }
        self.notify.notified().await;
    }
}
