//! Voice-layer error taxonomy (§7).

use thiserror::Error;

use crate::handle::ResponseId;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("role '{0}' is not configured for this session")]
    UnknownRole(String),

    #[error("no voice configured for role '{0}'")]
    MissingVoice(String),

    #[error("role '{0}' is already speaking")]
    RoleAlreadySpeaking(String),

    #[error("timed out creating connection for role '{0}'")]
    ConnectionCreateTimeout(String),

    #[error("upstream transport error on role '{role}': {message}")]
    Transport { role: String, message: String },

    #[error("no active response {0} to cancel")]
    NoActiveResponse(ResponseId),

    #[error("malformed upstream event: {0}")]
    MalformedUpstreamEvent(String),
}
