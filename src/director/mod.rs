//! Director decision contract (§4.5).
//!
//! The Director is specified by its contract, not its internals: given a
//! read-only [`SessionSnapshot`] and the last user utterance, produce a
//! [`Plan`] that is always well-formed (invariant 4 in §8), even when the
//! chosen implementation strategy fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionSnapshot;

/// The closed beat set (Glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Beat {
    Reveal,
    Check,
    Deepen,
    Twist,
    Continue,
    LensShift,
    Feynman,
    Montage,
    Minigame,
    ExitTicket,
}

impl Beat {
    pub fn all() -> Vec<Beat> {
        vec![
            Beat::Reveal,
            Beat::Check,
            Beat::Deepen,
            Beat::Twist,
            Beat::Continue,
            Beat::LensShift,
            Beat::Feynman,
            Beat::Montage,
            Beat::Minigame,
            Beat::ExitTicket,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Beat::Reveal => "reveal",
            Beat::Check => "check",
            Beat::Deepen => "deepen",
            Beat::Twist => "twist",
            Beat::Continue => "continue",
            Beat::LensShift => "lens_shift",
            Beat::Feynman => "feynman",
            Beat::Montage => "montage",
            Beat::Minigame => "minigame",
            Beat::ExitTicket => "exit_ticket",
        }
    }
}

/// Inferred mind state driving a rescue beat choice (§4.5 rule 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MindState {
    Fog,
    Illusion,
    Partial,
    Clear,
}

/// Debug-only substructure; informational, never consumed by the Gateway.
#[derive(Debug, Clone)]
pub struct PlanDebug {
    pub candidates: Vec<Beat>,
    pub reason: String,
    pub mind_state: MindState,
}

/// Four short labelled lines handed to the voice model verbatim.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub state: String,
    pub beat: String,
    pub interactive_mode: String,
    pub direction: String,
}

impl Instruction {
    pub fn render(&self) -> String {
        format!(
            "state: {}\nbeat: {}\ninteractive mode: {}\ndirection: {}",
            self.state, self.beat, self.interactive_mode, self.direction
        )
    }
}

/// The structured result of one Director invocation (§3 "Director Plan").
#[derive(Debug, Clone)]
pub struct Plan {
    pub next_role: String,
    pub next_beat: Beat,
    pub instruction: Instruction,
    pub debug: Option<PlanDebug>,
}

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("session has no allowed roles configured")]
    NoAllowedRoles,
}

const CONFUSION_MARKERS: &[&str] = &["我不明白", "不懂", "confused", "i don't understand", "what"];

fn contains_confusion_marker(text: &str) -> bool {
    let lowered = text.to_lowercase();
    CONFUSION_MARKERS.iter().any(|m| lowered.contains(m))
}

fn infer_mind_state(snapshot: &SessionSnapshot) -> MindState {
    if !snapshot.misconceptions.is_empty() {
        MindState::Illusion
    } else if snapshot.mastery < 0.4 {
        MindState::Fog
    } else if snapshot.load > 7 {
        MindState::Partial
    } else {
        MindState::Clear
    }
}

fn default_role_index(snapshot: &SessionSnapshot) -> usize {
    if snapshot.allowed_roles.is_empty() {
        0
    } else {
        snapshot.completed_assistant_turns % snapshot.allowed_roles.len()
    }
}

/// Runs the rule-based decision path described in §4.5. This is the
/// fallback path for a model-backed Director, and stands alone as the
/// whole Director when no model is wired in.
pub fn decide_rule_based(snapshot: &SessionSnapshot) -> Result<Plan, DirectorError> {
    if snapshot.allowed_roles.is_empty() {
        return Err(DirectorError::NoAllowedRoles);
    }

    let role_index = default_role_index(snapshot);
    let mut next_role = snapshot.allowed_roles[role_index].clone();

    // Rule 1: output-clock preemption. Hard constraint, checked first and
    // nothing below may override it.
    let (mut next_beat, mut reason, mind_state);
    if snapshot.output_clock_sec >= 90 {
        next_beat = Beat::Check;
        reason = "output_clock preemption".to_string();
        mind_state = infer_mind_state(snapshot);
    } else if snapshot.last_user_chars < 10 && snapshot.last_user_latency_ms > 5_000 {
        // Rule 2: fatigue override.
        next_beat = Beat::Minigame;
        reason = "fatigue override".to_string();
        mind_state = infer_mind_state(snapshot);
    } else {
        mind_state = infer_mind_state(snapshot);
        let is_rescue = !snapshot.misconceptions.is_empty()
            || snapshot.mastery < 0.4
            || snapshot.load > 7
            || contains_confusion_marker(&snapshot.last_user_utterance);

        if is_rescue {
            next_beat = match mind_state {
                MindState::Illusion => Beat::Twist,
                MindState::Fog => Beat::Reveal,
                MindState::Partial => Beat::LensShift,
                MindState::Clear => Beat::Check,
            };
            reason = "rescue".to_string();
        } else {
            next_beat = Beat::Continue;
            reason = "flow".to_string();
        }
    }

    // Rule 5: guardrails — defends against a bad role_index or an
    // out-of-band beat a future strategy might hand us.
    if !snapshot.allowed_roles.contains(&next_role) {
        tracing::warn!(role = %next_role, "director: repairing invalid role to first allowed");
        next_role = snapshot.allowed_roles[0].clone();
    }
    if !Beat::all().contains(&next_beat) {
        tracing::warn!(?next_beat, "director: repairing invalid beat to check");
        next_beat = Beat::Check;
    }

    let instruction = render_instruction(mind_state, next_beat, snapshot);

    Ok(Plan {
        next_role,
        next_beat,
        instruction,
        debug: Some(PlanDebug {
            candidates: candidate_set(mind_state, snapshot),
            reason,
            mind_state,
        }),
    })
}

fn candidate_set(mind_state: MindState, snapshot: &SessionSnapshot) -> Vec<Beat> {
    if snapshot.output_clock_sec >= 90 {
        return vec![Beat::Check, Beat::Feynman, Beat::ExitTicket];
    }
    if snapshot.last_user_chars < 10 && snapshot.last_user_latency_ms > 5_000 {
        return vec![Beat::Minigame, Beat::ExitTicket];
    }
    let is_rescue = !snapshot.misconceptions.is_empty()
        || snapshot.mastery < 0.4
        || snapshot.load > 7
        || contains_confusion_marker(&snapshot.last_user_utterance);
    if is_rescue {
        let _ = mind_state;
        vec![Beat::Reveal, Beat::LensShift, Beat::Twist, Beat::Check]
    } else {
        vec![Beat::Continue, Beat::Deepen, Beat::Check]
    }
}

fn render_instruction(mind_state: MindState, beat: Beat, snapshot: &SessionSnapshot) -> Instruction {
    let state = match mind_state {
        MindState::Fog => "the user is lost and needs the concept re-grounded",
        MindState::Illusion => "the user believes something incorrect",
        MindState::Partial => "the user is partially following but overloaded",
        MindState::Clear => "the user is tracking well",
    };

    let interactive_mode = match beat {
        Beat::Reveal => "Reveal the key idea plainly, in one or two sentences.",
        Beat::Check => "Ask one short question that forces the user to answer in their own words.",
        Beat::Deepen => "Add one layer of nuance to what was just said.",
        Beat::Twist => "Introduce a complication that challenges the user's current belief.",
        Beat::Continue => "Continue the explanation naturally, one step further.",
        Beat::LensShift => "Re-explain the same idea through a different concrete analogy.",
        Beat::Feynman => "Ask the user to explain the idea back to you, simply.",
        Beat::Montage => "Rapidly summarize the last few turns as a recap.",
        Beat::Minigame => "Propose a short interactive game to re-engage the user.",
        Beat::ExitTicket => "Ask one final wrap-up question before ending the session.",
    };

    let direction = snapshot
        .turns
        .last()
        .map(|t| format!("anchor to: {}", t.text))
        .unwrap_or_else(|| "no prior turn; open the topic".to_string());

    Instruction {
        state: state.to_string(),
        beat: beat.as_str().to_string(),
        interactive_mode: interactive_mode.to_string(),
        direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_snapshot() -> SessionSnapshot {
        SessionSnapshot {
            allowed_roles: vec!["host".to_string(), "expert".to_string()],
            turns: Vec::new(),
            mastery: 0.2,
            misconceptions: Vec::new(),
            tension: 0,
            load: 0,
            output_clock_sec: 0,
            last_user_chars: 20,
            last_user_latency_ms: 500,
            last_user_utterance: "机会成本是什么？".to_string(),
            completed_assistant_turns: 0,
        }
    }

    #[test]
    fn plan_is_always_well_formed() {
        let snapshot = base_snapshot();
        let plan = decide_rule_based(&snapshot).unwrap();
        assert!(snapshot.allowed_roles.contains(&plan.next_role));
        assert!(Beat::all().contains(&plan.next_beat));
    }

    #[test]
    fn output_clock_preemption_forces_output_beats() {
        let mut snapshot = base_snapshot();
        snapshot.output_clock_sec = 95;
        snapshot.mastery = 0.9;
        let plan = decide_rule_based(&snapshot).unwrap();
        assert!(matches!(plan.next_beat, Beat::Check | Beat::Feynman | Beat::ExitTicket));
    }

    #[test]
    fn fatigue_override_forces_disengagement_beats() {
        let mut snapshot = base_snapshot();
        snapshot.last_user_chars = 3;
        snapshot.last_user_latency_ms = 8_000;
        let plan = decide_rule_based(&snapshot).unwrap();
        assert!(matches!(plan.next_beat, Beat::Minigame | Beat::ExitTicket));
    }

    #[test]
    fn rescue_beat_chosen_when_mastery_is_low() {
        let mut snapshot = base_snapshot();
        snapshot.mastery = 0.1;
        let plan = decide_rule_based(&snapshot).unwrap();
        assert!(matches!(
            plan.next_beat,
            Beat::Reveal | Beat::LensShift | Beat::Twist | Beat::Check
        ));
    }

    #[test]
    fn role_rotates_with_completed_assistant_turns() {
        let mut snapshot = base_snapshot();
        snapshot.completed_assistant_turns = 1;
        let plan = decide_rule_based(&snapshot).unwrap();
        assert_eq!(plan.next_role, "expert");
    }

    #[test]
    fn empty_allowed_roles_is_an_error_not_a_panic() {
        let mut snapshot = base_snapshot();
        snapshot.allowed_roles.clear();
        assert!(matches!(decide_rule_based(&snapshot), Err(DirectorError::NoAllowedRoles)));
    }
}
