//! Speech Scheduler (§4.4).
//!
//! One loop per Gateway, serializing "have character X say Y" requests so
//! that at most one character is audible at a time (§8 invariant 1).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::voice::role_connection::PendingMetadata;
use crate::voice::voice_pool::VoicePool;
use crate::voice::VoiceError;

const DEFAULT_MAX_REQUEUE_ATTEMPTS: u32 = 8;

/// §3 "Pending Speech Request".
#[derive(Debug, Clone)]
pub struct PendingSpeechRequest {
    pub role: String,
    pub instruction: String,
    pub metadata: PendingMetadata,
    pub enqueued_at: Instant,
    attempts: u32,
}

impl PendingSpeechRequest {
    pub fn new(role: impl Into<String>, instruction: impl Into<String>, metadata: PendingMetadata) -> Self {
        Self {
            role: role.into(),
            instruction: instruction.into(),
            metadata,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }
}

/// Sent by the Gateway when a response ends (completed or cancelled), so
/// the scheduler's wait can unblock and advance.
#[derive(Debug, Clone)]
pub struct SpeechEnded {
    pub role: String,
}

pub struct SpeechScheduler {
    queue: Mutex<VecDeque<PendingSpeechRequest>>,
    notify: Notify,
    speech_end_tx: mpsc::UnboundedSender<SpeechEnded>,
    speech_end_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SpeechEnded>>,
    max_requeue_attempts: u32,
}

impl SpeechScheduler {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            speech_end_tx: tx,
            speech_end_rx: tokio::sync::Mutex::new(rx),
            max_requeue_attempts: DEFAULT_MAX_REQUEUE_ATTEMPTS,
        })
    }

    pub fn enqueue(&self, request: PendingSpeechRequest) {
        self.queue.lock().push_back(request);
        self.notify.notify_one();
    }

    /// Truncates the queue atomically (§4.4). Idempotent on an empty queue
    /// (§8 round-trip law).
    pub fn drop_pending_speech(&self, reason: &str) {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return;
        }
        let dropped = queue.len();
        queue.clear();
        tracing::info!(dropped, reason, "speech scheduler: dropped pending speech");
    }

    pub fn notify_speech_ended(&self, role: impl Into<String>) {
        let _ = self.speech_end_tx.send(SpeechEnded { role: role.into() });
    }

    async fn dequeue(&self) -> PendingSpeechRequest {
        loop {
            if let Some(request) = self.queue.lock().pop_front() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    async fn recv_speech_end(&self) -> Option<SpeechEnded> {
        self.speech_end_rx.lock().await.recv().await
    }

    /// Runs until the Gateway cancels `voice_pool`'s governing token by
    /// dropping the scheduler; callers `tokio::spawn` this.
    pub async fn run(self: Arc<Self>, voice_pool: Arc<VoicePool>, safety_timeout: Duration) {
        loop {
            let mut request = self.dequeue().await;

            // Defensive check (§4.4 step 2): someone may already be
            // speaking (e.g. a race with a scheduler-external CreateResponse).
            if voice_pool.get_speaking_role().is_some() {
                let _ = tokio::time::timeout(safety_timeout, self.recv_speech_end()).await;
            }

            match voice_pool
                .create_response(&request.role, &request.instruction, request.metadata.clone())
                .await
            {
                Err(VoiceError::RoleAlreadySpeaking(_)) => {
                    if request.attempts < self.max_requeue_attempts {
                        request.attempts += 1;
                        self.queue.lock().push_back(request);
                        self.notify.notify_one();
                    } else {
                        tracing::warn!(
                            role = %request.role,
                            "speech scheduler: dropping request after max requeue attempts"
                        );
                    }
                    let _ = tokio::time::timeout(safety_timeout, self.recv_speech_end()).await;
                }
                Err(e) => {
                    tracing::warn!(role = %request.role, error = %e, "speech scheduler: dropping request");
                }
                Ok(()) => {
                    self.await_speech_end(&request.role, &voice_pool, safety_timeout).await;
                }
            }
        }
    }

    async fn await_speech_end(&self, role: &str, voice_pool: &Arc<VoicePool>, safety_timeout: Duration) {
        let deadline = Instant::now() + safety_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(role, "speech scheduler: safety timeout, force-cancelling");
                let _ = voice_pool.cancel_current_response().await;
                return;
            }
            match tokio::time::timeout(remaining, self.recv_speech_end()).await {
                Ok(Some(ended)) if ended.role == role => return,
                Ok(Some(ended)) => {
                    tracing::warn!(
                        expected = role,
                        got = %ended.role,
                        "speech scheduler: mismatched speech-end signal, advancing anyway"
                    );
                    return;
                }
                Ok(None) => return,
                Err(_elapsed) => {
                    tracing::warn!(role, "speech scheduler: safety timeout, force-cancelling");
                    let _ = voice_pool.cancel_current_response().await;
                    return;
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_pending_speech_is_idempotent_on_empty_queue() {
        let scheduler = SpeechScheduler::new();
        scheduler.drop_pending_speech("no-op");
        scheduler.drop_pending_speech("still no-op");
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn drop_pending_speech_truncates_whole_queue() {
        let scheduler = SpeechScheduler::new();
        scheduler.enqueue(PendingSpeechRequest::new("host", "say hi", PendingMetadata::default()));
        scheduler.enqueue(PendingSpeechRequest::new("expert", "say hi", PendingMetadata::default()));
        assert_eq!(scheduler.pending_len(), 2);
        scheduler.drop_pending_speech("client_barge_in");
        assert_eq!(scheduler.pending_len(), 0);
    }
}
