//! Session data model (§3).
//!
//! `Session` is owned exclusively by one Event Queue consumer
//! ([`crate::voice::event_queue::EventQueue`]); nothing outside that
//! consumer task is allowed to hold a `&mut Session`. Readers (the
//! Director, the Gateway) only ever see a [`SessionSnapshot`].

use chrono::{DateTime, Utc};

pub mod orchestrator;

/// Who produced a turn: the human user, or a character id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Character(String),
}

/// One immutable entry in the session's append log.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Character(role.into()),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self.role, TurnRole::Character(_))
    }
}

/// The mutable session record. Lives entirely inside the Event Queue's
/// consumer task.
#[derive(Debug, Clone)]
pub struct Session {
    pub bubble_id: String,
    pub allowed_roles: Vec<String>,
    pub turns: Vec<Turn>,
    pub mastery: f32,
    pub misconceptions: Vec<String>,
    pub tension: i32,
    pub load: i32,
    pub output_clock_sec: u64,
    pub last_user_chars: usize,
    pub last_user_latency_ms: u64,
}

impl Session {
    pub fn new(bubble_id: impl Into<String>, allowed_roles: Vec<String>) -> Self {
        Self {
            bubble_id: bubble_id.into(),
            allowed_roles,
            turns: Vec::new(),
            mastery: 0.2,
            misconceptions: Vec::new(),
            tension: 0,
            load: 0,
            output_clock_sec: 0,
            last_user_chars: 0,
            last_user_latency_ms: 0,
        }
    }

    pub fn append_user_turn(&mut self, text: impl Into<String>, latency_ms: u64) {
        let text = text.into();
        self.last_user_chars = text.chars().count();
        self.last_user_latency_ms = latency_ms;
        self.output_clock_sec = 0;
        self.turns.push(Turn::user(text));
    }

    pub fn append_assistant_turn(&mut self, role: impl Into<String>, text: impl Into<String>) {
        self.turns.push(Turn::assistant(role, text));
    }

    pub fn completed_assistant_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.is_assistant()).count()
    }

    pub fn snapshot(&self, last_user_utterance: impl Into<String>) -> SessionSnapshot {
        SessionSnapshot {
            allowed_roles: self.allowed_roles.clone(),
            turns: self.turns.clone(),
            mastery: self.mastery,
            misconceptions: self.misconceptions.clone(),
            tension: self.tension,
            load: self.load,
            output_clock_sec: self.output_clock_sec,
            last_user_chars: self.last_user_chars,
            last_user_latency_ms: self.last_user_latency_ms,
            last_user_utterance: last_user_utterance.into(),
            completed_assistant_turns: self.completed_assistant_turns(),
        }
    }
}

/// Read-only view handed to the Director. Cloned out of [`Session`] under
/// the Event Queue consumer so the Director never touches live state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub allowed_roles: Vec<String>,
    pub turns: Vec<Turn>,
    pub mastery: f32,
    pub misconceptions: Vec<String>,
    pub tension: i32,
    pub load: i32,
    pub output_clock_sec: u64,
    pub last_user_chars: usize,
    pub last_user_latency_ms: u64,
    pub last_user_utterance: String,
    pub completed_assistant_turns: usize,
}
