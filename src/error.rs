//! Crate-wide error taxonomy (§7).
//!
//! Each module boundary gets its own `thiserror` enum; this file aggregates
//! them into one `CoreError` for call sites that cross module boundaries
//! (e.g. the binary's `main`), following the `PipelineError`/`AdapterError`
//! layering used elsewhere in this codebase.

use thiserror::Error;

use crate::director::DirectorError;
use crate::voice::VoiceError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("no voice configured for role '{0}'")]
    MissingVoiceForRole(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error(transparent)]
    Director(#[from] DirectorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
