//! Per-key rate-limited retry queue for reconcile failures.
//!
//! Watch loops react to live informer events; a reconcile that fails against
//! a transient error (the kernel busy, an ipset lock held by another
//! process) must not be dropped on the floor the way a bare `warn!` does.
//! Failures are resubmitted here with growing back-off, following the same
//! Fibonacci progression the reconcile-error policy elsewhere in this corpus
//! uses (1m, 1m, 2m, 3m, 5m, 8m, 10m max).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy)]
struct FibonacciBackoff {
    min_secs: u64,
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Returns the delay for this attempt and advances the sequence.
    fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current_secs);
        let next_secs = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = next_secs.min(self.max_secs);
        delay
    }
}

struct Tracked {
    backoff: FibonacciBackoff,
    /// Bumped on every `retry()` call for a key so a timer from a
    /// superseded attempt finds itself stale and never redelivers.
    generation: u64,
}

/// A rate-limited requeue channel keyed by reconcile key (e.g.
/// `namespace/name`). `retry()` schedules redelivery of `item` after the
/// key's current back-off delay, then advances that key's back-off for next
/// time; `forget()` resets a key's back-off once it reconciles cleanly.
pub struct RetryQueue<T> {
    tracked: Mutex<HashMap<String, Tracked>>,
    sender: mpsc::UnboundedSender<(String, T)>,
    min_backoff_secs: u64,
    max_backoff_secs: u64,
}

impl<T: Send + 'static> RetryQueue<T> {
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, T)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tracked: Mutex::new(HashMap::new()),
            sender,
            min_backoff_secs: min_backoff.as_secs().max(1),
            max_backoff_secs: max_backoff.as_secs().max(1),
        });
        (queue, receiver)
    }

    /// Schedules `item` for redelivery under `key` after that key's next
    /// back-off delay. Does not block the caller; the delay is awaited in a
    /// spawned task.
    pub async fn retry(self: &Arc<Self>, key: String, item: T) {
        let (delay, generation) = {
            let mut tracked = self.tracked.lock().await;
            let entry = tracked.entry(key.clone()).or_insert_with(|| Tracked {
                backoff: FibonacciBackoff::new(self.min_backoff_secs, self.max_backoff_secs),
                generation: 0,
            });
            entry.generation += 1;
            (entry.backoff.next_delay(), entry.generation)
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = {
                let tracked = queue.tracked.lock().await;
                tracked.get(&key).map(|t| t.generation) == Some(generation)
            };
            if still_current {
                let _ = queue.sender.send((key, item));
            }
        });
    }

    /// Clears a key's back-off state once it reconciles successfully, so its
    /// next failure starts from the minimum delay again.
    pub async fn forget(&self, key: &str) {
        self.tracked.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_redelivers_the_item_after_its_backoff() {
        let (queue, mut rx) = RetryQueue::new(Duration::from_millis(1), Duration::from_millis(5));
        queue.retry("ns/pol".to_string(), 7u32).await;
        let (key, item) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(key, "ns/pol");
        assert_eq!(item, 7);
    }

    #[tokio::test]
    async fn a_second_retry_for_the_same_key_supersedes_the_first_timer() {
        let (queue, mut rx) = RetryQueue::new(Duration::from_secs(60), Duration::from_secs(600));
        queue.retry("ns/pol".to_string(), 1u32).await;
        queue.retry("ns/pol".to_string(), 2u32).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn forget_resets_the_backoff_for_the_next_failure() {
        let (queue, _rx) = RetryQueue::<u32>::new(Duration::from_secs(60), Duration::from_secs(600));
        queue.retry("ns/pol".to_string(), 1u32).await;
        queue.forget("ns/pol").await;
        assert!(queue.tracked.lock().await.get("ns/pol").is_none());
    }
}
