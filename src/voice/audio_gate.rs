//! Audio gate (§4.6, §9 "Audio gate vs. cancel request").
//!
//! A local, immediate mute, independent of the network-asynchronous
//! upstream cancel. Both are required; this file is only the local half.

use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct GateState {
    muted_role: Option<String>,
    since: Instant,
    reason: String,
}

/// `{mutedRole, since, reason}` guarded by a mutex (§4.6).
pub struct AudioGate {
    state: Mutex<GateState>,
}

impl AudioGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                muted_role: None,
                since: Instant::now(),
                reason: String::new(),
            }),
        }
    }

    pub fn mute(&self, role: impl Into<String>, reason: impl Into<String>) {
        let mut state = self.state.lock();
        state.muted_role = Some(role.into());
        state.since = Instant::now();
        state.reason = reason.into();
    }

    /// Cleared when a new `response.created` arrives for the same role, or
    /// on `response.cancelled` cleanup (§4.6).
    pub fn clear_for_role(&self, role: &str) {
        let mut state = self.state.lock();
        if state.muted_role.as_deref() == Some(role) {
            state.muted_role = None;
        }
    }

    pub fn clear(&self) {
        self.state.lock().muted_role = None;
    }

    /// Checked on every audio delta before forwarding to the client.
    pub fn is_role_muted(&self, role: &str) -> bool {
        self.state.lock().muted_role.as_deref() == Some(role)
    }
}

impl Default for AudioGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_gate_mutes_nobody() {
        let gate = AudioGate::new();
        assert!(!gate.is_role_muted("host"));
    }

    #[test]
    fn mute_then_check_same_role() {
        let gate = AudioGate::new();
        gate.mute("host", "client_barge_in");
        assert!(gate.is_role_muted("host"));
        assert!(!gate.is_role_muted("expert"));
    }

    #[test]
    fn clear_for_role_only_clears_matching_role() {
        let gate = AudioGate::new();
        gate.mute("host", "client_barge_in");
        gate.clear_for_role("expert");
        assert!(gate.is_role_muted("host"));
        gate.clear_for_role("host");
        assert!(!gate.is_role_muted("host"));
    }
}
