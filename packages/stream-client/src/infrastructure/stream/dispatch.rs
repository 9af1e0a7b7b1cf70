//! Dispatch Pool
//!
//! Bounded queue between the read pump and a fixed set of worker tasks that
//! run business callbacks.
//!
//! # Backpressure
//!
//! The read pump never waits on the queue. When it is full the newest
//! message is dropped and counted; a warning is logged on the first drop and
//! every 1000th after. Delivery is best-effort: memory stays bounded while
//! callbacks stall.
//!
//! # Ordering
//!
//! Messages enter the queue in receive order. Workers complete in any
//! order, so callbacks for different routing keys may observe messages out
//! of arrival order relative to each other.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::envelope::{Callback, InboundEnvelope};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::metrics::{CallbackFailure, ClientStats, record_callback_duration};

/// Drops between rate-limited warnings.
const DROP_WARN_EVERY: u64 = 1000;

/// Callback for messages without a per-subscription handler.
pub type DefaultCallback = Arc<RwLock<Option<Callback>>>;

/// Result of [`DispatchQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Message queued for a worker.
    Queued,
    /// Queue was full; message dropped.
    Dropped,
    /// Pool has shut down.
    Closed,
}

// =============================================================================
// Producer Side
// =============================================================================

/// Non-blocking producer handle used by the read pump.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<InboundEnvelope>,
    stats: Arc<ClientStats>,
}

impl DispatchQueue {
    /// Queue a message without waiting.
    pub fn submit(&self, envelope: InboundEnvelope) -> SubmitOutcome {
        match self.tx.try_send(envelope) {
            Ok(()) => SubmitOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                let dropped = self.stats.record_drop();
                if dropped == 1 || dropped % DROP_WARN_EVERY == 0 {
                    tracing::warn!(
                        dropped,
                        routing_key = %envelope.routing_key(),
                        "Dispatch queue full, dropping newest message"
                    );
                }
                SubmitOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SubmitOutcome::Closed,
        }
    }
}

// =============================================================================
// Worker Side
// =============================================================================

/// Worker pool waiting to be started.
pub struct DispatchPool {
    rx: Arc<Mutex<mpsc::Receiver<InboundEnvelope>>>,
    registry: Arc<SubscriptionRegistry>,
    default_callback: DefaultCallback,
    stats: Arc<ClientStats>,
}

impl std::fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPool").finish_non_exhaustive()
    }
}

/// Create a queue with `capacity` slots and its (not yet started) pool.
#[must_use]
pub fn channel(
    capacity: usize,
    registry: Arc<SubscriptionRegistry>,
    default_callback: DefaultCallback,
    stats: Arc<ClientStats>,
) -> (DispatchQueue, DispatchPool) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let queue = DispatchQueue {
        tx,
        stats: Arc::clone(&stats),
    };
    let pool = DispatchPool {
        rx: Arc::new(Mutex::new(rx)),
        registry,
        default_callback,
        stats,
    };
    (queue, pool)
}

impl DispatchPool {
    /// Spawn `workers` worker tasks on `tracker`, stopping on `shutdown`.
    pub fn spawn(self, workers: usize, tracker: &TaskTracker, shutdown: &CancellationToken) {
        let pool = Arc::new(self);
        for id in 0..workers.max(1) {
            let pool = Arc::clone(&pool);
            let shutdown = shutdown.clone();
            tracker.spawn(async move { pool.work(id, shutdown).await });
        }
        tracing::debug!(workers, "Dispatch pool started");
    }

    async fn work(&self, id: usize, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = async { self.rx.lock().await.recv().await } => next,
            };

            let Some(envelope) = next else {
                break;
            };
            self.invoke(id, envelope).await;
        }
        tracing::trace!(worker = id, "Dispatch worker stopped");
    }

    async fn invoke(&self, id: usize, envelope: InboundEnvelope) {
        let routing_key = envelope.routing_key().clone();
        let callback = self
            .registry
            .callback_for(&routing_key)
            .or_else(|| {
                envelope
                    .channel_key()
                    .and_then(|channel| self.registry.callback_for(channel))
            })
            .or_else(|| self.default_callback.read().clone());

        let Some(callback) = callback else {
            tracing::trace!(%routing_key, "No callback registered, discarding message");
            return;
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { callback.call(envelope).await })
            .catch_unwind()
            .await;
        record_callback_duration(started.elapsed());

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.record_callback_error(CallbackFailure::Error);
                tracing::warn!(worker = id, %routing_key, error = %e, "Callback failed");
            }
            Err(_) => {
                self.stats.record_callback_error(CallbackFailure::Panic);
                tracing::error!(worker = id, %routing_key, "Callback panicked");
            }
        }
    }
}
