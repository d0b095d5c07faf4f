//! Metadata Registry (§3 "Response Metadata Record", §9 "Metadata-by-response-id").
//!
//! Upstream audio events carry only a response id. This is the join table
//! back to role/beat, guarded by a single reader-writer lock per §5
//! ("Metadata Registry has a single reader-writer lock; read paths are
//! lock-free short critical sections").

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;

use crate::handle::ResponseId;

#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    pub role: String,
    pub beat: Option<String>,
    pub sequence: u64,
    pub created_at: Instant,
    pub raw: HashMap<String, String>,
}

#[derive(Default)]
struct Inner {
    by_response_id: HashMap<ResponseId, ResponseMetadata>,
    latest_by_role: HashMap<String, ResponseId>,
    next_sequence: u64,
}

/// Join table from upstream response id to the role/beat that produced it.
pub struct MetadataRegistry {
    inner: RwLock<Inner>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Registers on `response.created` (§9).
    pub fn register(
        &self,
        response_id: ResponseId,
        role: impl Into<String>,
        beat: Option<String>,
        raw: HashMap<String, String>,
    ) {
        let role = role.into();
        let mut inner = self.inner.write();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.latest_by_role.insert(role.clone(), response_id);
        inner.by_response_id.insert(
            response_id,
            ResponseMetadata {
                role,
                beat,
                sequence,
                created_at: Instant::now(),
                raw,
            },
        );
    }

    /// Unregisters on `response.done` / `response.cancelled` (§9).
    pub fn unregister(&self, response_id: ResponseId) -> Option<ResponseMetadata> {
        self.inner.write().by_response_id.remove(&response_id)
    }

    pub fn get(&self, response_id: ResponseId) -> Option<ResponseMetadata> {
        self.inner.read().by_response_id.get(&response_id).cloned()
    }

    /// "Latest metadata for role X" — used to build outbound `tts_started`.
    pub fn latest_for_role(&self, role: &str) -> Option<ResponseMetadata> {
        let inner = self.inner.read();
        let response_id = inner.latest_by_role.get(role)?;
        inner.by_response_id.get(response_id).cloned()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_response_id.clear();
        inner.latest_by_role.clear();
    }
}

impl Default for MetadataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_get_round_trips() {
        let registry = MetadataRegistry::new();
        let id = ResponseId::new();
        registry.register(id, "host", Some("reveal".to_string()), HashMap::new());
        let record = registry.get(id).expect("should be registered");
        assert_eq!(record.role, "host");
        assert_eq!(record.beat.as_deref(), Some("reveal"));
    }

    #[test]
    fn unregister_removes_the_record() {
        let registry = MetadataRegistry::new();
        let id = ResponseId::new();
        registry.register(id, "host", None, HashMap::new());
        assert!(registry.unregister(id).is_some());
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn latest_for_role_tracks_most_recent_registration() {
        let registry = MetadataRegistry::new();
        let first = ResponseId::new();
        let second = ResponseId::new();
        registry.register(first, "host", None, HashMap::new());
        registry.register(second, "host", None, HashMap::new());
        let latest = registry.latest_for_role("host").unwrap();
        assert_eq!(latest.sequence, 1);
    }

    #[test]
    fn clear_drops_everything() {
        let registry = MetadataRegistry::new();
        registry.register(ResponseId::new(), "host", None, HashMap::new());
        registry.clear();
        assert!(registry.latest_for_role("host").is_none());
    }
}
