//! Environment-driven configuration (§6 "Environment / configuration", §10).

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::director::Beat;
use crate::error::ConfigError;

/// Tuning knobs named in §5 with the defaults the source there implies.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub event_handler: Duration,
    pub event_handler_warn_threshold: Duration,
    pub role_connection_create: Duration,
    pub scheduler_safety: Duration,
    pub event_queue_sync_default: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            event_handler: Duration::from_secs(10),
            event_handler_warn_threshold: Duration::from_secs(5),
            role_connection_create: Duration::from_secs(45),
            scheduler_safety: Duration::from_secs(360),
            event_queue_sync_default: Duration::from_secs(10),
        }
    }
}

/// Upstream audio format, pinned per §6 ("raw PCM16 @ 24 kHz mono" on the
/// client edge; the upstream leg is independently configurable).
#[derive(Debug, Clone)]
pub struct AudioFormat {
    pub sample_rate_hz: u32,
    pub encoding: String,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate_hz: 24_000,
            encoding: "pcm16".to_string(),
        }
    }
}

/// Everything "the surrounding shell supplies" per §6, loaded once at
/// process start.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_api_key: String,
    pub upstream_base_url: String,
    pub model_id: String,
    pub voice_by_role: HashMap<String, String>,
    pub allowed_roles: Vec<String>,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub vad_threshold: f32,
    pub beats: Vec<Beat>,
    pub default_instruction: String,
    pub event_queue_capacity: usize,
    pub timeouts: Timeouts,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// `TUTOR_VOICE_ROLES` is a comma-separated list of role ids;
    /// `TUTOR_VOICE_VOICE_<ROLE>` (uppercased) supplies that role's
    /// immutable upstream voice string.
    pub fn from_env() -> Result<Self, ConfigError> {
        let upstream_api_key = require_var("TUTOR_VOICE_UPSTREAM_API_KEY")?;
        let upstream_base_url = env::var("TUTOR_VOICE_UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "wss://upstream.invalid/v1/realtime".to_string());
        let model_id = env::var("TUTOR_VOICE_MODEL_ID")
            .unwrap_or_else(|_| "realtime-default".to_string());

        let allowed_roles: Vec<String> = require_var("TUTOR_VOICE_ROLES")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if allowed_roles.is_empty() {
            return Err(ConfigError::InvalidValue {
                var: "TUTOR_VOICE_ROLES".to_string(),
                message: "must list at least one role".to_string(),
            });
        }

        let mut voice_by_role = HashMap::new();
        for role in &allowed_roles {
            let var = format!("TUTOR_VOICE_VOICE_{}", role.to_uppercase());
            let voice = env::var(&var)
                .map_err(|_| ConfigError::MissingVoiceForRole(role.clone()))?;
            voice_by_role.insert(role.clone(), voice);
        }

        let vad_threshold: f32 = env::var("TUTOR_VOICE_VAD_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.5);

        let event_queue_capacity: usize = env::var("TUTOR_VOICE_EVENT_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        let default_instruction = env::var("TUTOR_VOICE_DEFAULT_INSTRUCTION")
            .unwrap_or_else(|_| "Continue the lesson naturally.".to_string());

        Ok(Self {
            upstream_api_key,
            upstream_base_url,
            model_id,
            voice_by_role,
            allowed_roles,
            input_audio_format: AudioFormat::default(),
            output_audio_format: AudioFormat::default(),
            vad_threshold,
            beats: Beat::all(),
            default_instruction,
            event_queue_capacity,
            timeouts: Timeouts::default(),
        })
    }
}

fn require_var(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_match_spec_defaults() {
        let t = Timeouts::default();
        assert_eq!(t.event_handler, Duration::from_secs(10));
        assert_eq!(t.role_connection_create, Duration::from_secs(45));
        assert_eq!(t.scheduler_safety, Duration::from_secs(360));
    }

    #[test]
    fn missing_required_var_is_reported_by_name() {
        env::remove_var("TUTOR_VOICE_UPSTREAM_API_KEY_TEST_MISSING");
        let err = require_var("TUTOR_VOICE_UPSTREAM_API_KEY_TEST_MISSING").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(name) if name == "TUTOR_VOICE_UPSTREAM_API_KEY_TEST_MISSING"));
    }
}
