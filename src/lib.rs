//! Real-time conversational core for a multi-speaker voice tutor.
//!
//! A browser opens one bidirectional stream to [`voice::gateway::Gateway`],
//! which multiplexes it against one upstream voice endpoint per character
//! role plus a recognition-only endpoint, mirrors text across them, and
//! drives the turn-by-turn pedagogical [`director`] state machine through
//! the [`session::orchestrator::Orchestrator`]. HTTP bootstrap, the LLM
//! client implementation, the upstream vendor's wire protocol internals
//! beyond its event taxonomy, the pedagogical content library, and
//! long-term persistence all live outside this crate.

pub mod config;
pub mod director;
pub mod error;
pub mod handle;
pub mod llm;
pub mod session;
pub mod voice;

pub use error::CoreError;
