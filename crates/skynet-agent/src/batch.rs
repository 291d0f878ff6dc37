use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

/// Default coalescing window. Platform-typical range is 300ms-1s; pick the
/// middle of that range as the default.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(600);

struct PendingBatch<T> {
    items: Vec<T>,
    /// Bumped on every push; a scheduled flush only fires if the generation
    /// it captured is still current, so a late arrival restarts the window
    /// instead of racing an in-flight flush.
    generation: u64,
}

/// Per-thread debounce: holds incoming items for `debounce`, coalescing
/// further arrivals on the same thread key, then emits the whole batch at
/// once. Grounded on the same spawn/reset-timer shape the teacher uses for
/// its typing-indicator keepalive loop.
pub struct BatchCoordinator<T: Send + 'static> {
    pending: Mutex<HashMap<String, PendingBatch<T>>>,
    debounce: Duration,
    emit: mpsc::UnboundedSender<(String, Vec<T>)>,
}

impl<T: Send + 'static> BatchCoordinator<T> {
    /// Creates a coordinator and returns it alongside the receiver that
    /// yields coalesced `(thread_key, items)` batches.
    pub fn new(debounce: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Vec<T>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                pending: Mutex::new(HashMap::new()),
                debounce,
                emit: tx,
            }),
            rx,
        )
    }

    pub fn with_default_debounce() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Vec<T>)>) {
        Self::new(DEFAULT_DEBOUNCE)
    }

    /// Add `item` to the batch for `thread_key`, (re)starting the debounce
    /// window for that thread.
    pub fn push(self: &Arc<Self>, thread_key: String, item: T) {
        let generation = {
            let mut pending = self.pending.lock().unwrap();
            let batch = pending.entry(thread_key.clone()).or_insert_with(|| PendingBatch {
                items: Vec::new(),
                generation: 0,
            });
            batch.items.push(item);
            batch.generation += 1;
            batch.generation
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.try_flush(&thread_key, generation);
        });
    }

    /// Flush `thread_key` immediately regardless of the debounce window —
    /// used when the caller already knows no more arrivals are coming
    /// (e.g. an explicit "done typing" signal).
    pub fn flush_now(&self, thread_key: &str) {
        let generation = self
            .pending
            .lock()
            .unwrap()
            .get(thread_key)
            .map(|b| b.generation)
            .unwrap_or(0);
        if generation > 0 {
            self.try_flush(thread_key, generation);
        }
    }

    fn try_flush(&self, thread_key: &str, expected_generation: u64) {
        let items = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(thread_key) {
                Some(batch) if batch.generation == expected_generation => {
                    pending.remove(thread_key).map(|b| b.items)
                }
                _ => None,
            }
        };

        if let Some(items) = items {
            let _ = self.emit.send((thread_key.to_string(), items));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coalesces_rapid_arrivals_into_one_batch() {
        let (coordinator, mut rx) = BatchCoordinator::<&'static str>::new(Duration::from_millis(50));
        coordinator.push("thread-1".into(), "a");
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.push("thread-1".into(), "b");

        let (key, items) = rx.recv().await.unwrap();
        assert_eq!(key, "thread-1");
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn separate_threads_emit_separate_batches() {
        let (coordinator, mut rx) = BatchCoordinator::<&'static str>::new(Duration::from_millis(20));
        coordinator.push("thread-1".into(), "a");
        coordinator.push("thread-2".into(), "x");

        let mut seen = HashMap::new();
        for _ in 0..2 {
            let (key, items) = rx.recv().await.unwrap();
            seen.insert(key, items);
        }
        assert_eq!(seen.get("thread-1"), Some(&vec!["a"]));
        assert_eq!(seen.get("thread-2"), Some(&vec!["x"]));
    }

    #[tokio::test]
    async fn late_arrival_after_flush_starts_a_new_batch() {
        let (coordinator, mut rx) = BatchCoordinator::<&'static str>::new(Duration::from_millis(20));
        coordinator.push("thread-1".into(), "a");
        let (_, first) = rx.recv().await.unwrap();
        assert_eq!(first, vec!["a"]);

        coordinator.push("thread-1".into(), "b");
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(second, vec!["b"]);
    }
}
