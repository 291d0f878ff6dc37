use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::store::QueueStore;
use crate::types::{EnvelopeKind, WriteEnvelope};

/// Per-kind outcome a [`QueueConsumer`] reports back for a flushed batch.
///
/// `succeeded` envelopes are dropped; `failed` ones are re-queued with
/// backoff by the [`Flusher`].
pub struct FlushOutcome {
    pub succeeded: usize,
    pub failed: Vec<WriteEnvelope>,
}

/// Applies one kind-grouped batch of envelopes to durable storage.
///
/// Implemented once per consuming crate (`skynet-memory` for `Message`/
/// `File`, `skynet-users` for `UserStats`/`BalanceOp`, `skynet-agent` for
/// `ToolCall`) and registered with the [`Flusher`] at startup — this keeps
/// `skynet-queue` itself free of any dependency on those crates.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    async fn apply_batch(&self, kind: EnvelopeKind, batch: Vec<WriteEnvelope>) -> FlushOutcome;
}

/// Background flusher: pops a batch, groups it by kind, dispatches each
/// group to its registered consumer, and re-queues failures with backoff.
///
/// Grounded on the scheduler's poll-loop: a `tokio::select!` between a fixed
/// interval tick and a shutdown watch channel, with a final drain-to-empty
/// flush on shutdown so no queued write is lost.
pub struct Flusher {
    store: Arc<QueueStore>,
    consumers: HashMap<EnvelopeKind, Arc<dyn QueueConsumer>>,
    batch_size: usize,
    max_attempts: u32,
    backoff_base_secs: u64,
}

impl Flusher {
    pub fn new(store: Arc<QueueStore>, batch_size: usize, max_attempts: u32, backoff_base_secs: u64) -> Self {
        Self {
            store,
            consumers: HashMap::new(),
            batch_size,
            max_attempts,
            backoff_base_secs,
        }
    }

    pub fn register(&mut self, kind: EnvelopeKind, consumer: Arc<dyn QueueConsumer>) {
        self.consumers.insert(kind, consumer);
    }

    /// Main loop. Ticks every `interval`, flushing one batch per tick, until
    /// `shutdown` broadcasts `true` — at which point it drains the queue to
    /// empty before returning.
    pub async fn run(self, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!("write-behind flusher started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        error!("write-behind flush error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("write-behind flusher shutting down; draining queue");
                        self.drain().await;
                        break;
                    }
                }
            }
        }
    }

    /// Flush batches until the queue reports empty. Used both on shutdown
    /// and available to callers that want a synchronous drain (e.g. tests).
    pub async fn drain(&self) {
        loop {
            match self.flush_once().await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    error!("write-behind drain error: {e}");
                    break;
                }
            }
        }
    }

    /// Pop one batch, group by kind, apply, and re-queue failures.
    /// Returns the number of envelopes popped this round (0 means the queue
    /// had nothing ready).
    async fn flush_once(&self) -> crate::error::Result<usize> {
        let batch = self.store.pop_batch(self.batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut by_kind: HashMap<EnvelopeKind, Vec<WriteEnvelope>> = HashMap::new();
        for env in batch {
            by_kind.entry(env.kind).or_default().push(env);
        }

        let mut total = 0;
        for (kind, envs) in by_kind {
            total += envs.len();
            let Some(consumer) = self.consumers.get(&kind) else {
                warn!(kind = kind.as_str(), "no consumer registered; dropping batch");
                continue;
            };

            let outcome = consumer.apply_batch(kind, envs).await;
            if outcome.succeeded > 0 {
                info!(kind = kind.as_str(), count = outcome.succeeded, "flushed");
            }
            for failed in outcome.failed {
                match self
                    .store
                    .requeue_with_backoff(failed, self.max_attempts, self.backoff_base_secs)
                {
                    Ok(_) => {}
                    Err(e) => error!("requeue error: {e}"),
                }
            }
        }

        Ok(total)
    }
}
