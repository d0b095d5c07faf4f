//! Voice Pool (§4.2).
//!
//! Owns every Role Connection for a session plus the recognition-only
//! connection; implements text mirroring and is the sole authority on
//! "who is speaking".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::config::{AudioFormat, Config};
use crate::voice::error::VoiceError;
use crate::voice::role_connection::{PendingMetadata, RoleConnection, UpstreamTransport};

pub const RECOGNITION_ROLE: &str = "__recognition__";

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, role: &str, voice: &str) -> Result<Arc<dyn UpstreamTransport>, VoiceError>;
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    speaker: String, // "user" or "assistant"
    text: String,
    origin_role: Option<String>,
}

pub struct VoicePool {
    voice_by_role: HashMap<String, String>,
    recognition_voice: String,
    input_format: AudioFormat,
    vad_threshold: f32,
    connect_timeout: Duration,
    factory: Arc<dyn ConnectionFactory>,

    recognition: RwLock<Option<Arc<RoleConnection>>>,
    role_connections: RwLock<HashMap<String, Arc<RoleConnection>>>,
    creation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    speaking_role: Mutex<Option<String>>,
    history: Mutex<Vec<HistoryEntry>>,
    on_created: RwLock<Option<Arc<dyn Fn(Arc<RoleConnection>) + Send + Sync>>>,
}

impl VoicePool {
    pub fn new(config: &Config, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            voice_by_role: config.voice_by_role.clone(),
            recognition_voice: "recognition".to_string(),
            input_format: config.input_audio_format.clone(),
            vad_threshold: config.vad_threshold,
            connect_timeout: config.timeouts.role_connection_create,
            factory,
            recognition: RwLock::new(None),
            role_connections: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            speaking_role: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            on_created: RwLock::new(None),
        })
    }

    /// Installs the Gateway's hook for spawning an upstream reader task as
    /// soon as a Role Connection comes into existence (§4.1 "one reader
    /// per configured Role Connection" — connections are created lazily,
    /// so the reader is spawned lazily too, right alongside them).
    pub fn set_on_created(&self, hook: Arc<dyn Fn(Arc<RoleConnection>) + Send + Sync>) {
        *self.on_created.write() = Some(hook);
    }

    /// Eagerly creates the recognition connection (§4.2).
    pub async fn initialize(&self) -> Result<Arc<RoleConnection>, VoiceError> {
        let transport = self.connect_with_timeout(RECOGNITION_ROLE, &self.recognition_voice).await?;
        let conn = Arc::new(RoleConnection::new_recognition(self.recognition_voice.clone(), transport));
        conn.initialize(&self.input_format, self.vad_threshold).await?;
        *self.recognition.write() = Some(conn.clone());
        Ok(conn)
    }

    pub fn recognition_connection(&self) -> Option<Arc<RoleConnection>> {
        self.recognition.read().clone()
    }

    pub fn get_speaking_role(&self) -> Option<String> {
        self.speaking_role.lock().clone()
    }

    pub fn clear_speaking_role(&self) {
        *self.speaking_role.lock() = None;
    }

    fn role_lock(&self, role: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .lock()
            .entry(role.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn connect_with_timeout(
        &self,
        role: &str,
        voice: &str,
    ) -> Result<Arc<dyn UpstreamTransport>, VoiceError> {
        tokio::time::timeout(self.connect_timeout, self.factory.connect(role, voice))
            .await
            .map_err(|_| VoiceError::ConnectionCreateTimeout(role.to_string()))?
    }

    /// Single-flight lazy creation (§4.2): concurrent callers for the same
    /// uninitialized role see exactly one creation (§8 boundary behavior).
    pub async fn get_or_create_role_connection(
        self: &Arc<Self>,
        role: &str,
    ) -> Result<Arc<RoleConnection>, VoiceError> {
        if let Some(conn) = self.role_connections.read().get(role).cloned() {
            return Ok(conn);
        }
        let lock = self.role_lock(role);
        let _guard = lock.lock().await;
        if let Some(conn) = self.role_connections.read().get(role).cloned() {
            return Ok(conn);
        }

        let voice = self
            .voice_by_role
            .get(role)
            .cloned()
            .ok_or_else(|| VoiceError::MissingVoice(role.to_string()))?;
        let transport = self.connect_with_timeout(role, &voice).await?;
        let conn = Arc::new(RoleConnection::new(role, voice, transport));
        conn.initialize(&self.input_format, self.vad_threshold).await?;
        self.role_connections.write().insert(role.to_string(), conn.clone());
        if let Some(hook) = self.on_created.read().clone() {
            hook(conn.clone());
        }
        Ok(conn)
    }

    fn already_created_roles(&self) -> Vec<Arc<RoleConnection>> {
        self.role_connections.read().values().cloned().collect()
    }

    fn configured_roles_without_connection(&self) -> Vec<String> {
        let created = self.role_connections.read();
        self.voice_by_role
            .keys()
            .filter(|role| !created.contains_key(*role))
            .cloned()
            .collect()
    }

    async fn replay_history_to(&self, conn: &Arc<RoleConnection>) {
        let snapshot = self.history.lock().clone();
        for entry in snapshot {
            if let Err(e) = conn.sync_text(&entry.speaker, &entry.text).await {
                tracing::warn!(role = conn.role(), error = %e, "voice pool: failed to replay history entry");
            }
        }
    }

    /// §4.2 `SyncUserText`. Never suspends the caller on role-connection
    /// creation (§5).
    pub async fn sync_user_text(self: &Arc<Self>, text: &str) {
        self.history.lock().push(HistoryEntry {
            speaker: "user".to_string(),
            text: text.to_string(),
            origin_role: None,
        });

        for conn in self.already_created_roles() {
            if let Err(e) = conn.sync_text("user", text).await {
                tracing::warn!(role = conn.role(), error = %e, "voice pool: failed to mirror user text");
            }
        }

        for role in self.configured_roles_without_connection() {
            let pool = self.clone();
            tokio::spawn(async move {
                match pool.get_or_create_role_connection(&role).await {
                    Ok(conn) => pool.replay_history_to(&conn).await,
                    Err(e) => tracing::warn!(role, error = %e, "voice pool: lazy creation failed"),
                }
            });
        }
    }

    /// §4.2 `SyncAssistantText`: never delivered to the recognition
    /// endpoint, never mirrored back to its own origin role.
    pub async fn sync_assistant_text(&self, text: &str, from_role: &str) {
        self.history.lock().push(HistoryEntry {
            speaker: "assistant".to_string(),
            text: text.to_string(),
            origin_role: Some(from_role.to_string()),
        });

        for conn in self.already_created_roles() {
            if conn.role() == from_role {
                continue;
            }
            if let Err(e) = conn.sync_text("assistant", text).await {
                tracing::warn!(role = conn.role(), error = %e, "voice pool: failed to mirror assistant text");
            }
        }
    }

    pub async fn create_response(
        self: &Arc<Self>,
        role: &str,
        instruction: &str,
        metadata: PendingMetadata,
    ) -> Result<(), VoiceError> {
        let conn = self.get_or_create_role_connection(role).await?;

        {
            let mut speaking = self.speaking_role.lock();
            if speaking.is_some() {
                return Err(VoiceError::RoleAlreadySpeaking(role.to_string()));
            }
            *speaking = Some(role.to_string());
        }

        if let Err(e) = conn.open_response(instruction, metadata).await {
            self.clear_speaking_role();
            return Err(e);
        }
        Ok(())
    }

    pub async fn cancel_current_response(&self) -> Result<(), VoiceError> {
        let role = match self.get_speaking_role() {
            Some(role) => role,
            None => return Ok(()),
        };
        let conn = self.role_connections.read().get(&role).cloned();
        if let Some(conn) = conn {
            conn.cancel_active().await
        } else {
            Ok(())
        }
    }

    pub fn role_connection(&self, role: &str) -> Option<Arc<RoleConnection>> {
        self.role_connections.read().get(role).cloned()
    }

    pub async fn close(&self) {
        for conn in self.already_created_roles() {
            conn.close().await;
        }
        if let Some(recognition) = self.recognition_connection() {
            recognition.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::role_connection::test_support::FakeTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        connects: AtomicUsize,
        transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                transports: Mutex::new(HashMap::new()),
            }
        }

        fn transport_for(&self, role: &str) -> Arc<FakeTransport> {
            self.transports.lock().get(role).cloned().expect("connected")
        }
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn connect(&self, role: &str, _voice: &str) -> Result<Arc<dyn UpstreamTransport>, VoiceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (transport, _tx) = FakeTransport::new();
            self.transports.lock().insert(role.to_string(), transport.clone());
            Ok(transport)
        }
    }

    fn test_config() -> Config {
        let mut voice_by_role = HashMap::new();
        voice_by_role.insert("host".to_string(), "alloy".to_string());
        voice_by_role.insert("expert".to_string(), "sol".to_string());
        Config {
            upstream_api_key: "test".to_string(),
            upstream_base_url: "wss://test.invalid".to_string(),
            model_id: "test-model".to_string(),
            voice_by_role,
            allowed_roles: vec!["host".to_string(), "expert".to_string()],
            input_audio_format: AudioFormat::default(),
            output_audio_format: AudioFormat::default(),
            vad_threshold: 0.5,
            beats: crate::director::Beat::all(),
            default_instruction: "continue".to_string(),
            event_queue_capacity: 100,
            timeouts: crate::config::Timeouts::default(),
        }
    }

    #[tokio::test]
    async fn concurrent_creation_requests_share_one_connection() {
        let factory = Arc::new(CountingFactory::new());
        let pool = VoicePool::new(&test_config(), factory.clone());

        let a = pool.clone();
        let b = pool.clone();
        let (ra, rb) = tokio::join!(
            async move { a.get_or_create_role_connection("host").await },
            async move { b.get_or_create_role_connection("host").await },
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();
        assert!(Arc::ptr_eq(&ra, &rb));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_response_rejects_when_another_role_is_speaking() {
        let factory = Arc::new(CountingFactory::new());
        let pool = VoicePool::new(&test_config(), factory);

        pool.create_response("host", "say hi", PendingMetadata::default()).await.unwrap();
        let err = pool
            .create_response("expert", "say hi", PendingMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::RoleAlreadySpeaking(_)));
    }

    #[tokio::test]
    async fn cancel_current_response_is_a_no_op_when_nobody_is_speaking() {
        let factory = Arc::new(CountingFactory::new());
        let pool = VoicePool::new(&test_config(), factory);
        pool.cancel_current_response().await.unwrap();
    }

    #[tokio::test]
    async fn sync_assistant_text_never_reaches_its_own_origin_role() {
        let factory = Arc::new(CountingFactory::new());
        let pool = VoicePool::new(&test_config(), factory.clone());
        pool.get_or_create_role_connection("host").await.unwrap();
        pool.get_or_create_role_connection("expert").await.unwrap();

        pool.sync_assistant_text("hello from host", "host").await;

        let host_sent = factory.transport_for("host").sent.lock().len();
        let expert_sent = factory.transport_for("expert").sent.lock().len();
        // Both connections received one SessionUpdate on init; only expert
        // should additionally receive the mirrored ConversationItemCreate.
        assert_eq!(host_sent, 1, "origin role must not receive its own mirrored text");
        assert_eq!(expert_sent, 2, "other roles must receive the mirrored assistant text");
    }
}
