//! Role Connection (§3, §4.2, §9 "Fixed per-role voice").
//!
//! One upstream voice endpoint bound to a fixed character voice for the
//! life of the session. The recognition-only connection is also modeled
//! as a `RoleConnection` (with `is_recognition = true`) since it shares
//! the same send/receive/active-response lifecycle; the Gateway enforces
//! the recognition-specific rules (never produces audio, role mirrors
//! never reach it) at the call sites in §4.1/§4.2.
//!
//! The real upstream socket is abstracted behind [`UpstreamTransport`] so
//! this module (and its tests) never depend on a concrete vendor
//! connection, matching the `InputAdapter`/`OutputAdapter` trait-object
//! style used for out-of-scope hardware/vendor adapters elsewhere in this
//! codebase.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::AudioFormat;
use crate::handle::ResponseId;
use crate::voice::error::VoiceError;
use crate::voice::types::{
    ContentPart, ConversationItem, SessionConfig, UpstreamClientEvent, UpstreamServerEvent,
};

/// Metadata stashed by the Voice Pool when a response is requested, so the
/// Gateway can pick it up on `response.created` (§4.1, §9).
#[derive(Debug, Clone, Default)]
pub struct PendingMetadata {
    pub beat: Option<String>,
    pub raw: HashMap<String, String>,
}

/// The upstream socket, abstracted for testability.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, event: UpstreamClientEvent) -> Result<(), VoiceError>;
    /// Returns `None` once the connection is closed.
    async fn recv(&self) -> Option<UpstreamServerEvent>;
    async fn close(&self);
}

/// One upstream voice endpoint. Send-side calls serialize through
/// `send_lock` (§5 "Each Role Connection socket has its own send mutex").
pub struct RoleConnection {
    role: String,
    voice: String,
    is_recognition: bool,
    transport: Arc<dyn UpstreamTransport>,
    send_lock: AsyncMutex<()>,
    active_response: Mutex<Option<ResponseId>>,
    pending_metadata: Mutex<Option<PendingMetadata>>,
}

impl RoleConnection {
    pub fn new(role: impl Into<String>, voice: impl Into<String>, transport: Arc<dyn UpstreamTransport>) -> Self {
        Self {
            role: role.into(),
            voice: voice.into(),
            is_recognition: false,
            transport,
            send_lock: AsyncMutex::new(()),
            active_response: Mutex::new(None),
            pending_metadata: Mutex::new(None),
        }
    }

    pub fn new_recognition(voice: impl Into<String>, transport: Arc<dyn UpstreamTransport>) -> Self {
        let mut conn = Self::new("__recognition__", voice, transport);
        conn.is_recognition = true;
        conn
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Immutable for the life of the session (§4.2, invariant 6 in §8).
    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn is_recognition(&self) -> bool {
        self.is_recognition
    }

    /// Sent once at connection creation (§4.2).
    pub async fn initialize(&self, format: &AudioFormat, vad_threshold: f32) -> Result<(), VoiceError> {
        let config = if self.is_recognition {
            SessionConfig {
                modalities: vec!["text".to_string()],
                voice: self.voice.clone(),
                input_audio_format: format.encoding.clone(),
                output_audio_format: format.encoding.clone(),
                turn_detection_enabled: true,
                transcription_model: Some("whisper-1".to_string()),
                instructions: None,
            }
        } else {
            SessionConfig {
                modalities: vec!["text".to_string(), "audio".to_string()],
                voice: self.voice.clone(),
                input_audio_format: format.encoding.clone(),
                output_audio_format: format.encoding.clone(),
                turn_detection_enabled: false,
                transcription_model: None,
                instructions: None,
            }
        };
        let _ = vad_threshold;
        self.send(UpstreamClientEvent::SessionUpdate { session: config }).await
    }

    async fn send(&self, event: UpstreamClientEvent) -> Result<(), VoiceError> {
        let _guard = self.send_lock.lock().await;
        self.transport.send(event).await.map_err(|e| match e {
            VoiceError::Transport { .. } => e,
            other => other,
        })
    }

    /// Injects a user or assistant text turn into this connection's
    /// conversation history (§4.2 `SyncUserText`/`SyncAssistantText`).
    pub async fn sync_text(&self, speaker_role: &str, text: &str) -> Result<(), VoiceError> {
        let item = ConversationItem {
            item_type: "message".to_string(),
            role: Some(speaker_role.to_string()),
            content: Some(vec![ContentPart {
                part_type: "input_text".to_string(),
                text: Some(text.to_string()),
            }]),
        };
        self.send(UpstreamClientEvent::ConversationItemCreate { item }).await
    }

    pub async fn append_audio(&self, base64_pcm16: String) -> Result<(), VoiceError> {
        self.send(UpstreamClientEvent::InputAudioBufferAppend { audio: base64_pcm16 })
            .await
    }

    /// Stashes metadata for the Gateway to register once `response.created`
    /// arrives, then requests the response (§4.2 `CreateResponse`).
    pub async fn open_response(
        &self,
        instruction: &str,
        metadata: PendingMetadata,
    ) -> Result<(), VoiceError> {
        *self.pending_metadata.lock() = Some(metadata);
        self.send(UpstreamClientEvent::ResponseCreate {
            instructions: Some(instruction.to_string()),
        })
        .await
    }

    pub fn take_pending_metadata(&self) -> Option<PendingMetadata> {
        self.pending_metadata.lock().take()
    }

    pub async fn cancel_active(&self) -> Result<(), VoiceError> {
        if self.active_response.lock().is_none() {
            return Ok(());
        }
        self.send(UpstreamClientEvent::ResponseCancel).await
    }

    pub fn set_active_response(&self, id: ResponseId) {
        *self.active_response.lock() = Some(id);
    }

    /// Idempotence law (§8): `SetActiveResponse` then `ClearActiveResponse`
    /// returns the connection to the equivalent (empty) state.
    pub fn clear_active_response(&self) {
        *self.active_response.lock() = None;
    }

    pub fn active_response(&self) -> Option<ResponseId> {
        *self.active_response.lock()
    }

    pub async fn next_event(&self) -> Option<UpstreamServerEvent> {
        self.transport.recv().await
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeTransport;
    use super::*;

    #[tokio::test]
    async fn voice_is_immutable_across_calls() {
        let (transport, _tx) = FakeTransport::new();
        let conn = RoleConnection::new("host", "alloy", transport);
        assert_eq!(conn.voice(), "alloy");
        assert_eq!(conn.voice(), "alloy");
    }

    #[tokio::test]
    async fn set_then_clear_active_response_is_idempotent_round_trip() {
        let (transport, _tx) = FakeTransport::new();
        let conn = RoleConnection::new("host", "alloy", transport);
        assert!(conn.active_response().is_none());
        conn.set_active_response(ResponseId::new());
        assert!(conn.active_response().is_some());
        conn.clear_active_response();
        assert!(conn.active_response().is_none());
        // second clear is a no-op, not an error
        conn.clear_active_response();
        assert!(conn.active_response().is_none());
    }

    #[tokio::test]
    async fn cancel_active_is_a_no_op_when_nothing_is_active() {
        let (transport, _tx) = FakeTransport::new();
        let conn = RoleConnection::new("host", "alloy", transport.clone());
        conn.cancel_active().await.unwrap();
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn open_response_stashes_metadata_for_later_pickup() {
        let (transport, _tx) = FakeTransport::new();
        let conn = RoleConnection::new("host", "alloy", transport);
        conn.open_response(
            "say hello",
            PendingMetadata {
                beat: Some("reveal".to_string()),
                raw: HashMap::new(),
            },
        )
        .await
        .unwrap();
        let metadata = conn.take_pending_metadata().expect("should be stashed");
        assert_eq!(metadata.beat.as_deref(), Some("reveal"));
        // taken once; a second take sees nothing left
        assert!(conn.take_pending_metadata().is_none());
    }
}
