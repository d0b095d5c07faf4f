//! Gateway (§4.1).
//!
//! The only component that talks to the browser directly. Mediates
//! between the client's single bidirectional stream and every upstream
//! voice connection, running the cross-cutting algorithms in §4.6 and
//! stamping the outbound envelope (`seq`, `server_ts`) described in §6.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::Config;
use crate::voice::audio_gate::AudioGate;
use crate::voice::error::VoiceError;
use crate::voice::event_queue::{EventHandler, EventQueue, SessionEvent};
use crate::voice::metadata::MetadataRegistry;
use crate::voice::role_connection::{PendingMetadata, RoleConnection};
use crate::voice::speech_scheduler::SpeechScheduler;
use crate::voice::types::{ClientEvent, ServerEnvelope, ServerMessage, UpstreamServerEvent};
use crate::voice::voice_pool::{ConnectionFactory, VoicePool};

/// A frame arriving on the client's single bidirectional stream.
#[derive(Debug, Clone)]
pub enum ClientInboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// The browser-facing socket, abstracted for testability the same way
/// [`crate::voice::role_connection::UpstreamTransport`] abstracts the
/// upstream leg.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send_text(&self, json: String) -> Result<(), VoiceError>;
    async fn send_binary(&self, data: Vec<u8>) -> Result<(), VoiceError>;
    /// Returns `None` once the client has disconnected.
    async fn recv(&self) -> Option<ClientInboundFrame>;
    async fn close(&self);
}

/// Which upstream event carries the authoritative transcript (§9 Open
/// Question, resolved: default to the dedicated transcription event;
/// `response.done.text` on the recognition connection is the fallback
/// source for vendors that only emit it that way).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrSource {
    TranscriptionCompleted,
    ResponseDone,
}

impl Default for AsrSource {
    fn default() -> Self {
        AsrSource::TranscriptionCompleted
    }
}

/// Collapses a duplicate transcript delivered by both ASR sources into a
/// single authoritative one (§4.6). One mutex over both fields so the
/// check-and-update is atomic.
struct AsrDedup {
    last: Mutex<Option<(String, Instant)>>,
    window: Duration,
}

impl AsrDedup {
    fn new() -> Self {
        Self {
            last: Mutex::new(None),
            window: Duration::from_secs(2),
        }
    }

    fn is_duplicate(&self, text: &str) -> bool {
        let mut last = self.last.lock();
        let duplicate = matches!(&*last, Some((seen, at)) if seen == text && at.elapsed() < self.window);
        *last = Some((text.to_string(), Instant::now()));
        duplicate
    }
}

pub struct Gateway {
    allowed_roles: Vec<String>,
    client: Arc<dyn ClientTransport>,
    voice_pool: Arc<VoicePool>,
    scheduler: Arc<SpeechScheduler>,
    event_queue: EventQueue,
    event_handler: Arc<dyn EventHandler>,
    metadata_registry: MetadataRegistry,
    audio_gate: AudioGate,
    asr_dedup: AsrDedup,
    asr_source: AsrSource,
    speech_started_at: Mutex<Option<Instant>>,
    next_seq: AtomicU64,
    closed: AtomicBool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    safety_timeout: Duration,
}

impl Gateway {
    pub fn new(
        config: &Config,
        client: Arc<dyn ClientTransport>,
        factory: Arc<dyn ConnectionFactory>,
        event_handler: Arc<dyn EventHandler>,
        scheduler: Arc<SpeechScheduler>,
    ) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        let gateway = Arc::new(Self {
            allowed_roles: config.allowed_roles.clone(),
            client,
            voice_pool: VoicePool::new(config, factory),
            scheduler,
            event_queue: EventQueue::start(
                config.event_queue_capacity,
                event_handler.clone(),
                config.timeouts.event_handler,
                config.timeouts.event_handler_warn_threshold,
            ),
            event_handler,
            metadata_registry: MetadataRegistry::new(),
            audio_gate: AudioGate::new(),
            asr_dedup: AsrDedup::new(),
            asr_source: AsrSource::default(),
            speech_started_at: Mutex::new(None),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            done_tx,
            done_rx,
            safety_timeout: config.timeouts.scheduler_safety,
        });

        let weak = Arc::downgrade(&gateway);
        gateway.voice_pool.set_on_created(Arc::new(move |conn| {
            if let Some(gateway) = weak.upgrade() {
                gateway.spawn_role_reader(conn);
            }
        }));

        gateway
    }

    /// §4.1 `Start`: creates the recognition connection, launches the
    /// client reader and the Speech Scheduler loop. Role Connection
    /// readers are launched lazily as those connections come into being
    /// (see `set_on_created` above).
    pub async fn start(self: &Arc<Self>) -> Result<(), VoiceError> {
        let recognition = self.voice_pool.initialize().await?;
        self.spawn_recognition_reader(recognition);
        self.spawn_client_reader();

        let scheduler = self.scheduler.clone();
        let pool = self.voice_pool.clone();
        let safety_timeout = self.safety_timeout;
        tokio::spawn(async move { scheduler.run(pool, safety_timeout).await });

        tracing::info!("gateway started");
        Ok(())
    }

    /// §4.1 `SendInstructions`. Non-blocking: enqueues onto the Speech
    /// Scheduler and returns immediately.
    pub fn send_instructions(
        &self,
        role: &str,
        instruction: &str,
        metadata: PendingMetadata,
    ) -> Result<(), VoiceError> {
        if !self.allowed_roles.iter().any(|r| r == role) {
            return Err(VoiceError::UnknownRole(role.to_string()));
        }
        self.scheduler.enqueue(crate::voice::speech_scheduler::PendingSpeechRequest::new(
            role,
            instruction,
            metadata,
        ));
        Ok(())
    }

    /// §4.1 `Close`: idempotent teardown of every owned resource.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.drop_pending_speech("gateway_close");
        self.event_queue.close().await;
        self.metadata_registry.clear();
        self.voice_pool.close().await;
        self.client.close().await;
        let _ = self.done_tx.send(true);
        tracing::info!("gateway closed");
    }

    /// §4.1 `Done`: resolves once `close` has run, even if `close` already
    /// ran before this was called.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn spawn_client_reader(self: &Arc<Self>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                match gateway.client.recv().await {
                    Some(ClientInboundFrame::Close) | None => break,
                    Some(frame) => gateway.handle_client_frame(frame).await,
                }
            }
            gateway.close().await;
        });
    }

    fn spawn_recognition_reader(self: &Arc<Self>, conn: Arc<RoleConnection>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            while let Some(event) = conn.next_event().await {
                gateway.handle_recognition_event(&conn, event).await;
            }
        });
    }

    fn spawn_role_reader(self: &Arc<Self>, conn: Arc<RoleConnection>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            while let Some(event) = conn.next_event().await {
                gateway.handle_role_event(&conn, event).await;
            }
        });
    }

    fn stamp(&self, message: ServerMessage) -> ServerEnvelope {
        ServerEnvelope {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            server_ts: chrono::Utc::now().timestamp_millis(),
            message,
        }
    }

    async fn send_to_client(&self, message: ServerMessage) {
        let envelope = self.stamp(message);
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                if let Err(e) = self.client.send_text(json).await {
                    tracing::warn!(error = %e, "gateway: failed to send to client");
                }
            }
            Err(e) => tracing::error!(error = %e, "gateway: failed to serialize outbound message"),
        }
    }

    async fn handle_client_frame(self: &Arc<Self>, frame: ClientInboundFrame) {
        match frame {
            ClientInboundFrame::Binary(bytes) => {
                if let Some(recognition) = self.voice_pool.recognition_connection() {
                    if let Err(e) = recognition.append_audio(BASE64.encode(bytes)).await {
                        tracing::warn!(error = %e, "gateway: failed to append recognition audio");
                    }
                }
            }
            ClientInboundFrame::Text(text) => self.handle_client_text(&text).await,
            ClientInboundFrame::Close => {}
        }
    }

    async fn handle_client_text(self: &Arc<Self>, text: &str) {
        let event: ClientEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "gateway: malformed client event, dropping");
                return;
            }
        };

        if matches!(event, ClientEvent::BargeIn { .. }) {
            self.handle_barge_in().await;
        }

        if !self.event_queue.enqueue(SessionEvent::Client(event.clone())) {
            tracing::warn!("gateway: event queue unreachable, falling back to synchronous dispatch");
            self.event_handler.handle(SessionEvent::Client(event)).await;
        }
    }

    /// Shared core of barge-in mediation (§4.1): drop whatever's queued,
    /// mute whoever is currently speaking, cancel their in-flight response.
    /// Callers differ only in whether the client gets told explicitly —
    /// the explicit `barge_in` path does, the recognition-VAD fallback
    /// below does not (the client already knows it started talking).
    async fn interrupt_current_speech(&self, reason: &str) {
        self.scheduler.drop_pending_speech(reason);
        if let Some(role) = self.voice_pool.get_speaking_role() {
            self.audio_gate.mute(&role, reason);
        }
        if let Err(e) = self.voice_pool.cancel_current_response().await {
            tracing::warn!(error = %e, "gateway: failed to cancel response on barge-in");
        }
    }

    async fn handle_barge_in(&self) {
        self.interrupt_current_speech("client_barge_in").await;
        self.send_to_client(ServerMessage::TtsInterrupted {
            reason: "client_barge_in".to_string(),
        })
        .await;
    }

    async fn handle_recognition_event(self: &Arc<Self>, conn: &Arc<RoleConnection>, event: UpstreamServerEvent) {
        let response_id = event.response_id();
        match event {
            UpstreamServerEvent::SpeechStarted => {
                // Server-side fallback for clients that never send an
                // explicit `barge_in` (§4.1): the recognition leg's VAD
                // firing is itself evidence the user started talking.
                *self.speech_started_at.lock() = Some(Instant::now());
                self.interrupt_current_speech("recognition_speech_started").await;
                self.send_to_client(ServerMessage::SpeechStarted).await;
            }
            UpstreamServerEvent::SpeechStopped => self.send_to_client(ServerMessage::SpeechStopped).await,
            UpstreamServerEvent::TranscriptionCompleted { transcript, .. } => {
                if self.asr_source == AsrSource::TranscriptionCompleted {
                    self.handle_authoritative_transcript(transcript).await;
                }
            }
            UpstreamServerEvent::ResponseCreated { .. } => {
                // The recognition endpoint must never hold the floor;
                // cancel before anything else looks at the transcript
                // this spurious response might also carry (§9).
                if let Some(id) = response_id {
                    conn.set_active_response(id);
                }
                if let Err(e) = conn.cancel_active().await {
                    tracing::warn!(error = %e, "gateway: failed to cancel spurious recognition response");
                }
            }
            UpstreamServerEvent::ResponseDone { text, .. } => {
                conn.clear_active_response();
                if self.asr_source == AsrSource::ResponseDone {
                    if let Some(transcript) = text {
                        self.handle_authoritative_transcript(transcript).await;
                    }
                }
            }
            UpstreamServerEvent::ResponseCancelled { .. } => {
                conn.clear_active_response();
            }
            UpstreamServerEvent::ResponseAudioDelta { .. }
            | UpstreamServerEvent::ResponseAudioTranscriptDelta { .. } => {
                tracing::warn!("gateway: recognition connection unexpectedly produced audio");
            }
            UpstreamServerEvent::Error { error } => {
                tracing::warn!(?error, "gateway: recognition connection error");
                self.send_to_client(ServerMessage::Error { error: error.message }).await;
            }
        }
    }

    async fn handle_authoritative_transcript(self: &Arc<Self>, transcript: String) {
        if self.asr_dedup.is_duplicate(&transcript) {
            tracing::debug!("gateway: dropping duplicate ASR transcript");
            return;
        }

        self.voice_pool.sync_user_text(&transcript).await;
        self.send_to_client(ServerMessage::AsrFinal { text: transcript.clone() }).await;

        // Utterance latency, speech_started -> this authoritative transcript.
        // Feeds the Director's fatigue-override rule (§4.5 rule 2).
        let latency_ms = self
            .speech_started_at
            .lock()
            .take()
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let event = SessionEvent::AsrFinal { text: transcript, latency_ms };
        if !self.event_queue.enqueue(event.clone()) {
            tracing::warn!("gateway: event queue unreachable, falling back to synchronous dispatch");
            self.event_handler.handle(event).await;
        }
    }

    async fn handle_role_event(self: &Arc<Self>, conn: &Arc<RoleConnection>, event: UpstreamServerEvent) {
        let role = conn.role().to_string();
        let response_id = event.response_id();
        match event {
            UpstreamServerEvent::ResponseCreated { .. } => {
                if let Some(id) = response_id {
                    let pending = conn.take_pending_metadata().unwrap_or_default();
                    self.metadata_registry.register(id, role.clone(), pending.beat, pending.raw);
                    conn.set_active_response(id);
                }
                self.audio_gate.clear_for_role(&role);
                // §9: resolve "latest metadata for role X" through the
                // role-index rather than trusting the connection's own
                // label, so `tts_started` reflects what was just registered.
                let announced_role = self
                    .metadata_registry
                    .latest_for_role(&role)
                    .map(|meta| meta.role)
                    .unwrap_or(role);
                self.send_to_client(ServerMessage::TtsStarted { role: announced_role }).await;
            }
            UpstreamServerEvent::ResponseAudioDelta { delta, .. } => {
                if self.audio_gate.is_role_muted(&role) {
                    return;
                }
                match BASE64.decode(delta) {
                    Ok(bytes) => {
                        if let Err(e) = self.client.send_binary(bytes).await {
                            tracing::warn!(error = %e, "gateway: failed to forward audio to client");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "gateway: malformed base64 audio delta"),
                }
            }
            UpstreamServerEvent::ResponseAudioTranscriptDelta { .. } => {}
            UpstreamServerEvent::ResponseDone { text, .. } => {
                if let Some(id) = response_id {
                    if let Some(meta) = self.metadata_registry.get(id) {
                        tracing::debug!(role = %role, beat = ?meta.beat, "gateway: response completed for beat");
                    }
                    self.metadata_registry.unregister(id);
                }
                conn.clear_active_response();
                if self.voice_pool.get_speaking_role().as_deref() == Some(role.as_str()) {
                    self.voice_pool.clear_speaking_role();
                }
                if let Some(text) = text {
                    self.voice_pool.sync_assistant_text(&text, &role).await;
                    self.send_to_client(ServerMessage::AssistantText { role: role.clone(), text: text.clone() })
                        .await;
                    let event = SessionEvent::AssistantText { role: role.clone(), text };
                    if !self.event_queue.enqueue(event.clone()) {
                        self.event_handler.handle(event).await;
                    }
                }
                self.send_to_client(ServerMessage::TtsCompleted { role: role.clone() }).await;
                self.scheduler.notify_speech_ended(role);
            }
            UpstreamServerEvent::ResponseCancelled { .. } => {
                if let Some(id) = response_id {
                    self.metadata_registry.unregister(id);
                }
                conn.clear_active_response();
                if self.voice_pool.get_speaking_role().as_deref() == Some(role.as_str()) {
                    self.voice_pool.clear_speaking_role();
                }
                self.send_to_client(ServerMessage::TtsCompleted { role: role.clone() }).await;
                self.scheduler.notify_speech_ended(role);
            }
            UpstreamServerEvent::SpeechStarted | UpstreamServerEvent::SpeechStopped => {
                tracing::debug!(role = role.as_str(), "gateway: unexpected VAD event on a role connection");
            }
            UpstreamServerEvent::TranscriptionCompleted { .. } => {
                tracing::debug!(role = role.as_str(), "gateway: unexpected transcription event on a role connection");
            }
            UpstreamServerEvent::Error { error } => {
                tracing::warn!(role = role.as_str(), ?error, "gateway: role connection error");
                self.send_to_client(ServerMessage::Error { error: error.message }).await;
            }
        }
    }
}

#[cfg(test)]
mod test_support {
    use super::*;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    pub struct FakeClientTransport {
        pub sent_text: Mutex<Vec<String>>,
        pub sent_binary: Mutex<Vec<Vec<u8>>>,
        incoming: AsyncMutex<mpsc::UnboundedReceiver<ClientInboundFrame>>,
    }

    impl FakeClientTransport {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<ClientInboundFrame>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sent_text: Mutex::new(Vec::new()),
                    sent_binary: Mutex::new(Vec::new()),
                    incoming: AsyncMutex::new(rx),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl ClientTransport for FakeClientTransport {
        async fn send_text(&self, json: String) -> Result<(), VoiceError> {
            self.sent_text.lock().push(json);
            Ok(())
        }

        async fn send_binary(&self, data: Vec<u8>) -> Result<(), VoiceError> {
            self.sent_binary.lock().push(data);
            Ok(())
        }

        async fn recv(&self) -> Option<ClientInboundFrame> {
            self.incoming.lock().await.recv().await
        }

        async fn close(&self) {}
    }
}
