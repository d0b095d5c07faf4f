//! Wire types for both edges of the Gateway (§6).
//!
//! Client-facing types mirror the inbound/outbound tables in §6 verbatim.
//! Upstream vendor types pin down the event taxonomy §6 assumes, grounded
//! on the `ClientEvent`/`ServerEvent` shape used for the (also
//! out-of-scope) realtime vendor surface elsewhere in this codebase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handle::ResponseId;

// ---------------------------------------------------------------------
// Client-facing protocol
// ---------------------------------------------------------------------

/// Inbound JSON client events, dispatched by `type` (§6 inbound table).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    BargeIn {
        event_id: String,
        client_ts: i64,
    },
    QuizAnswer {
        question_id: String,
        answer: Value,
    },
    ExitRequested {
        event_id: String,
    },
    WorldEntered {
        metadata: Value,
    },
    #[serde(other)]
    Other,
}

/// Catch-all capture of an inbound event that doesn't match a known
/// variant, preserved so it can still be forwarded to the Orchestrator
/// verbatim (§6: "any other | free-form | forward to orchestrator").
#[derive(Debug, Clone, Deserialize)]
pub struct RawClientEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub rest: Value,
}

/// Outbound server message payloads (§6 outbound table), before the
/// envelope (`seq`, `server_ts`) is stamped on by the Gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TtsStarted {
        role: String,
    },
    TtsCompleted {
        role: String,
    },
    TtsInterrupted {
        reason: String,
    },
    SpeechStarted,
    SpeechStopped,
    AsrFinal {
        text: String,
    },
    AssistantText {
        role: String,
        text: String,
    },
    QuizShow {
        quiz_id: String,
        question: String,
        options: Vec<String>,
        context: String,
    },
    Error {
        error: String,
    },
}

/// Every server message carries a monotonic `seq` and `server_ts` (§6).
#[derive(Debug, Clone, Serialize)]
pub struct ServerEnvelope {
    pub seq: u64,
    pub server_ts: i64,
    #[serde(flatten)]
    pub message: ServerMessage,
}

// ---------------------------------------------------------------------
// Upstream vendor protocol (§6 "Upstream voice endpoints")
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection_enabled: bool,
    pub transcription_model: Option<String>,
    pub instructions: Option<String>,
}

/// Client → upstream. Grounded on the realtime-vendor `ClientEvent` shape
/// used elsewhere in this codebase for an out-of-scope vendor surface;
/// adapted here to the subset §6 actually names.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate { instructions: Option<String> },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: Option<String>,
    pub content: Option<Vec<ContentPart>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: Option<String>,
    pub message: String,
}

/// Upstream → server (§6 "Downstream events").
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamServerEvent {
    #[serde(rename = "response.created")]
    ResponseCreated { response_id: String },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { response_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { response_id: String, delta: String },
    #[serde(rename = "response.done")]
    ResponseDone {
        response_id: String,
        text: Option<String>,
    },
    #[serde(rename = "response.cancelled")]
    ResponseCancelled { response_id: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        item_id: String,
        transcript: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "error")]
    Error { error: UpstreamErrorInfo },
}

impl UpstreamServerEvent {
    pub fn response_id(&self) -> Option<ResponseId> {
        let raw = match self {
            UpstreamServerEvent::ResponseCreated { response_id } => Some(response_id),
            UpstreamServerEvent::ResponseAudioDelta { response_id, .. } => Some(response_id),
            UpstreamServerEvent::ResponseAudioTranscriptDelta { response_id, .. } => {
                Some(response_id)
            }
            UpstreamServerEvent::ResponseDone { response_id, .. } => Some(response_id),
            UpstreamServerEvent::ResponseCancelled { response_id } => Some(response_id),
            _ => None,
        }?;
        raw.parse().ok().map(ResponseId::from_uuid)
            .or_else(|| Some(deterministic_response_id(raw)))
    }
}

/// Vendor response ids are opaque strings, not necessarily UUIDs; derive
/// a stable `ResponseId` from the string so the rest of the system can
/// keep using one id type throughout.
fn deterministic_response_id(raw: &str) -> ResponseId {
    use uuid::Uuid;
    ResponseId::from_uuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_dispatches_on_type_tag() {
        let json = r#"{"type":"barge_in","event_id":"e1","client_ts":123}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ClientEvent::BargeIn { .. }));
    }

    #[test]
    fn unknown_client_event_type_falls_through_to_other() {
        let json = r#"{"type":"something_new","foo":"bar"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ClientEvent::Other));
    }

    #[test]
    fn deterministic_response_id_is_stable_for_same_string() {
        let a = deterministic_response_id("resp_abc123");
        let b = deterministic_response_id("resp_abc123");
        assert_eq!(a, b);
    }

    #[test]
    fn upstream_done_event_exposes_response_id() {
        let event = UpstreamServerEvent::ResponseDone {
            response_id: "resp_xyz".to_string(),
            text: Some("hi".to_string()),
        };
        assert!(event.response_id().is_some());
    }
}
