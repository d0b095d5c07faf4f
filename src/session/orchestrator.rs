//! Session Orchestrator (§2).
//!
//! Consumes events from the Event Queue, updates session state, invokes
//! the Director, and submits the resulting instruction to the Gateway.
//! This is the [`crate::voice::event_queue::EventHandler`] installed on
//! the Event Queue — it runs entirely inside that queue's single consumer
//! task, which is what makes "all mutations to session state happen on
//! this single consumer" (§4.3) true by construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::director::{self, Plan};
use crate::llm::LlmClient;
use crate::session::Session;
use crate::voice::event_queue::{EventHandler, SessionEvent};
use crate::voice::role_connection::PendingMetadata;
use crate::voice::speech_scheduler::{PendingSpeechRequest, SpeechScheduler};
use crate::voice::VoiceError;

/// The Orchestrator's only way to reach the Gateway: enqueue a speech
/// request. Kept as a small, cheaply-cloneable handle instead of a
/// reference to the full Gateway so construction order isn't circular
/// (the Gateway's Event Queue is installed with the Orchestrator as its
/// handler, and the Orchestrator needs a way back into the Gateway before
/// the Gateway itself exists).
#[derive(Clone)]
pub struct GatewayHandle {
    allowed_roles: Vec<String>,
    scheduler: Arc<SpeechScheduler>,
}

impl GatewayHandle {
    pub fn new(allowed_roles: Vec<String>, scheduler: Arc<SpeechScheduler>) -> Self {
        Self { allowed_roles, scheduler }
    }

    /// §4.1 `SendInstructions`: non-blocking, never calls upstream inline.
    pub fn send_instructions(
        &self,
        role: &str,
        instruction: &str,
        metadata: PendingMetadata,
    ) -> Result<(), VoiceError> {
        if !self.allowed_roles.iter().any(|r| r == role) {
            return Err(VoiceError::UnknownRole(role.to_string()));
        }
        self.scheduler
            .enqueue(PendingSpeechRequest::new(role, instruction, metadata));
        Ok(())
    }
}

pub struct Orchestrator {
    session: Mutex<Session>,
    gateway: GatewayHandle,
    llm_director: Option<Arc<dyn LlmClient>>,
    llm_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        bubble_id: impl Into<String>,
        allowed_roles: Vec<String>,
        gateway: GatewayHandle,
        llm_director: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        Self {
            session: Mutex::new(Session::new(bubble_id, allowed_roles)),
            gateway,
            llm_director,
            llm_timeout: Duration::from_secs(5),
        }
    }

    async fn decide(&self, snapshot: &crate::session::SessionSnapshot) -> Plan {
        if let Some(llm) = &self.llm_director {
            let attempt = tokio::time::timeout(
                self.llm_timeout,
                crate::llm::decide_with_llm(llm.as_ref(), snapshot),
            )
            .await;
            match attempt {
                Ok(Ok(plan)) => return plan,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "director: model-backed decision failed, falling back to rule-based");
                }
                Err(_elapsed) => {
                    tracing::warn!("director: model-backed decision timed out, falling back to rule-based");
                }
            }
        }

        director::decide_rule_based(snapshot).unwrap_or_else(|e| {
            tracing::error!(error = %e, "director: rule-based decision failed, using degraded fallback plan");
            degraded_fallback_plan(snapshot)
        })
    }

    async fn on_asr_final(&self, text: String, latency_ms: u64) {
        let snapshot = {
            let mut session = self.session.lock();
            session.append_user_turn(text.clone(), latency_ms);
            session.snapshot(text)
        };

        let plan = self.decide(&snapshot).await;
        let metadata = PendingMetadata {
            beat: Some(plan.next_beat.as_str().to_string()),
            raw: std::collections::HashMap::new(),
        };
        if let Err(e) = self
            .gateway
            .send_instructions(&plan.next_role, &plan.instruction.render(), metadata)
        {
            tracing::warn!(error = %e, "orchestrator: failed to dispatch director plan");
        }
    }

    fn on_assistant_text(&self, role: String, text: String) {
        self.session.lock().append_assistant_turn(role, text);
    }
}

#[async_trait]
impl EventHandler for Orchestrator {
    async fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::AsrFinal { text, latency_ms } => self.on_asr_final(text, latency_ms).await,
            SessionEvent::AssistantText { role, text } => self.on_assistant_text(role, text),
            SessionEvent::Client(_client_event) => {
                // Content-specific handling (quiz grading, exit flows) is
                // pedagogical content logic and out of scope (§1); the
                // core's job is only to have gotten the event here in
                // order, which it has by virtue of running inside the
                // queue's single consumer.
            }
        }
    }
}

/// Used only if the rule-based Director itself errors (empty allowed-role
/// set) — which `Config::from_env` should already have prevented upstream.
/// Exists so the Orchestrator never panics on a misconfigured session
/// (§7: "Nothing in the core panics").
fn degraded_fallback_plan(snapshot: &crate::session::SessionSnapshot) -> Plan {
    use crate::director::{Beat, Instruction};
    let role = snapshot
        .allowed_roles
        .first()
        .cloned()
        .unwrap_or_else(|| "host".to_string());
    Plan {
        next_role: role,
        next_beat: Beat::Check,
        instruction: Instruction {
            state: "unknown".to_string(),
            beat: Beat::Check.as_str().to_string(),
            interactive_mode: "Ask the user a simple check-in question.".to_string(),
            direction: "no session configuration available".to_string(),
        },
        debug: None,
    }
}
