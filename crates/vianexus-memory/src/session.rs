use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::store::{HistoryFilter, MemoryStore};
use crate::types::{ConversationSession, UniversalMessage};

/// Parameters for [`SessionManager::create_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionSpec {
    /// Explicit id; generated when absent.
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub client_type: Option<String>,
    pub system_prompt: Option<String>,
    pub context_tags: Option<Vec<String>>,
    pub session_metadata: Option<Map<String, Value>>,
    /// Overwrite an existing session instead of failing.
    pub force_new: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub session_id: String,
    pub user_id: Option<String>,
    pub client_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub duration_seconds: i64,
    pub message_count: usize,
    pub role_distribution: HashMap<String, usize>,
    pub message_types: HashMap<String, usize>,
    pub providers_used: Vec<String>,
    pub context_tags: Option<Vec<String>>,
    pub session_size_bytes: usize,
}

/// Complete isolated view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session: ConversationSession,
    pub messages: Vec<UniversalMessage>,
    pub message_count: usize,
    pub session_size_bytes: usize,
}

/// Issues unique session ids and guarantees session isolation on top of a
/// [`MemoryStore`]. Holds an in-process cache of active sessions.
pub struct SessionManager {
    store: Arc<dyn MemoryStore>,
    active: DashMap<String, ConversationSession>,
    /// Advisory claims held only for the create+save critical section.
    create_claims: DashMap<String, ()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            active: DashMap::new(),
            create_claims: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Generate `<client_type>_<user_id>_<context>_<YYYYMMDD_HHMMSS>_<8-hex>`
    /// with absent parts omitted. Collisions against the active cache get a
    /// numeric suffix.
    pub fn generate_session_id(
        &self,
        user_id: Option<&str>,
        client_type: Option<&str>,
        context: Option<&str>,
    ) -> String {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let unique = Uuid::new_v4().simple().to_string();

        let mut parts: Vec<String> = Vec::new();
        if let Some(client_type) = client_type {
            parts.push(client_type.to_string());
        }
        if let Some(user_id) = user_id {
            parts.push(user_id.to_string());
        }
        if let Some(context) = context {
            parts.push(context.replace(' ', "_"));
        }
        parts.push(timestamp.to_string());
        parts.push(unique[..8].to_string());

        self.dedupe_session_id(parts.join("_"))
    }

    fn dedupe_session_id(&self, candidate: String) -> String {
        if !self.active.contains_key(&candidate) {
            return candidate;
        }
        let mut counter = 1;
        loop {
            let suffixed = format!("{candidate}_{counter}");
            if !self.active.contains_key(&suffixed) {
                return suffixed;
            }
            counter += 1;
        }
    }

    pub async fn create_session(&self, spec: SessionSpec) -> Result<ConversationSession> {
        let session_id = match spec.session_id.clone() {
            Some(id) => id,
            None => {
                let context = spec
                    .session_metadata
                    .as_ref()
                    .and_then(|m| m.get("context"))
                    .and_then(Value::as_str);
                self.generate_session_id(
                    spec.user_id.as_deref(),
                    spec.client_type.as_deref(),
                    context,
                )
            }
        };

        if !spec.force_new {
            if let Some(_existing) = self.store.get_session(&session_id).await? {
                return Err(MemoryError::SessionExists(session_id));
            }
        }

        // advisory claim: scoped to create+save, not the session lifetime
        if self.create_claims.insert(session_id.clone(), ()).is_some() {
            return Err(MemoryError::SessionBusy(session_id));
        }
        let result = self.create_and_save(&session_id, spec).await;
        self.create_claims.remove(&session_id);
        result
    }

    async fn create_and_save(
        &self,
        session_id: &str,
        spec: SessionSpec,
    ) -> Result<ConversationSession> {
        let mut session = ConversationSession::new(session_id);
        session.user_id = spec.user_id;
        session.client_type = spec.client_type;
        session.system_prompt = spec.system_prompt;
        session.context_tags = Some(spec.context_tags.unwrap_or_default());
        session.session_metadata = Some(spec.session_metadata.unwrap_or_default());

        if !self.store.save_session(&session).await? {
            return Err(MemoryError::Storage(format!(
                "failed to save session {session_id}"
            )));
        }

        self.active.insert(session_id.to_string(), session.clone());
        info!(session_id, "created new session");
        Ok(session)
    }

    /// Cache-through session lookup.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<ConversationSession>> {
        if let Some(session) = self.active.get(session_id) {
            return Ok(Some(session.value().clone()));
        }

        let session = self.store.get_session(session_id).await?;
        if let Some(session) = &session {
            self.active
                .insert(session_id.to_string(), session.clone());
            debug!(session_id, "loaded session from storage");
        }
        Ok(session)
    }

    /// Idempotent: returns the existing session or creates a new one with the
    /// supplied metadata.
    pub async fn ensure_session_exists(
        &self,
        session_id: &str,
        spec: SessionSpec,
    ) -> Result<ConversationSession> {
        if let Some(session) = self.get_session(session_id).await? {
            return Ok(session);
        }

        let spec = SessionSpec {
            session_id: Some(session_id.to_string()),
            ..spec
        };
        match self.create_session(spec).await {
            Ok(session) => Ok(session),
            // lost a creation race — the session exists now
            Err(MemoryError::SessionExists(_)) | Err(MemoryError::SessionBusy(_)) => self
                .get_session(session_id)
                .await?
                .ok_or_else(|| MemoryError::SessionNotFound(session_id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Copy a session and all its messages under a new id. Clones carry
    /// `cloned_from` provenance on both the session and every message.
    pub async fn clone_session(
        &self,
        source_session_id: &str,
        new_session_id: Option<String>,
        new_user_id: Option<String>,
    ) -> Result<ConversationSession> {
        let source = self
            .get_session(source_session_id)
            .await?
            .ok_or_else(|| MemoryError::SessionNotFound(source_session_id.to_string()))?;

        let new_session_id = new_session_id.unwrap_or_else(|| {
            self.generate_session_id(
                new_user_id.as_deref().or(source.user_id.as_deref()),
                source.client_type.as_deref(),
                Some("cloned"),
            )
        });

        let mut metadata = source.session_metadata.clone().unwrap_or_default();
        metadata.insert("cloned_from".to_string(), json!(source_session_id));
        metadata.insert("cloned_at".to_string(), json!(Utc::now().to_rfc3339()));

        let new_session = self
            .create_session(SessionSpec {
                session_id: Some(new_session_id.clone()),
                user_id: new_user_id.clone().or_else(|| source.user_id.clone()),
                client_type: source.client_type.clone(),
                system_prompt: source.system_prompt.clone(),
                context_tags: source.context_tags.clone(),
                session_metadata: Some(metadata),
                force_new: false,
            })
            .await?;

        let source_messages = self
            .store
            .get_conversation_history(source_session_id, HistoryFilter::default())
            .await?;
        let copied = source_messages.len();

        for message in source_messages {
            let mut metadata = message.metadata.clone().unwrap_or_default();
            metadata.insert("cloned_from".to_string(), json!(message.message_id));
            metadata.insert("original_session".to_string(), json!(source_session_id));

            let mut clone = UniversalMessage::new(message.role, message.content.clone());
            clone.message_type = message.message_type;
            clone.session_id = Some(new_session_id.clone());
            clone.user_id = new_user_id.clone().or(message.user_id);
            clone.provider = message.provider;
            clone.raw_content = message.raw_content;
            clone.tool_calls = message.tool_calls;
            clone.tool_results = message.tool_results;
            clone.context_tags = message.context_tags;
            clone.metadata = Some(metadata);

            self.store.save_message(&clone).await?;
        }

        info!(
            source = source_session_id,
            clone = %new_session_id,
            messages = copied,
            "cloned session"
        );
        Ok(new_session)
    }

    pub async fn get_session_statistics(&self, session_id: &str) -> Result<SessionStatistics> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| MemoryError::SessionNotFound(session_id.to_string()))?;

        let messages = self
            .store
            .get_conversation_history(session_id, HistoryFilter::default())
            .await?;

        let mut role_distribution: HashMap<String, usize> = HashMap::new();
        let mut message_types: HashMap<String, usize> = HashMap::new();
        let mut providers: Vec<String> = Vec::new();
        for message in &messages {
            *role_distribution.entry(message.role.to_string()).or_default() += 1;
            *message_types
                .entry(message.message_type.to_string())
                .or_default() += 1;
            if let Some(provider) = &message.provider {
                if !providers.contains(provider) {
                    providers.push(provider.clone());
                }
            }
        }

        Ok(SessionStatistics {
            session_id: session_id.to_string(),
            user_id: session.user_id.clone(),
            client_type: session.client_type.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            duration_seconds: (session.last_activity - session.created_at).num_seconds(),
            message_count: messages.len(),
            role_distribution,
            message_types,
            providers_used: providers,
            context_tags: session.context_tags.clone(),
            session_size_bytes: session_size_bytes(&session, &messages),
        })
    }

    /// Session metadata plus every message — the complete isolated view.
    pub async fn session_snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| MemoryError::SessionNotFound(session_id.to_string()))?;
        let messages = self
            .store
            .get_conversation_history(session_id, HistoryFilter::default())
            .await?;
        Ok(SessionSnapshot {
            message_count: messages.len(),
            session_size_bytes: session_size_bytes(&session, &messages),
            session,
            messages,
        })
    }

    pub async fn list_user_sessions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationSession>> {
        self.store.get_user_sessions(user_id, limit).await
    }

    /// Evict cache entries inactive for longer than `inactive_hours`.
    /// Persistent storage cleanup is the store's `cleanup_old_sessions`.
    pub fn cleanup_inactive_sessions(&self, inactive_hours: i64) -> usize {
        let cutoff = Utc::now() - Duration::hours(inactive_hours);
        let stale: Vec<String> = self
            .active
            .iter()
            .filter(|e| e.last_activity < cutoff)
            .map(|e| e.key().clone())
            .collect();

        for session_id in &stale {
            self.active.remove(session_id);
        }
        info!(count = stale.len(), "cleaned up inactive sessions from cache");
        stale.len()
    }
}

fn session_size_bytes(session: &ConversationSession, messages: &[UniversalMessage]) -> usize {
    let session_size = session.to_json().map(|j| j.len()).unwrap_or(0);
    let messages_size: usize = messages
        .iter()
        .map(|m| m.to_json().map(|j| j.len()).unwrap_or(0))
        .sum();
    session_size + messages_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryStore;
    use crate::types::MessageRole;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(InMemoryStore::new()))
    }

    fn spec(session_id: &str, user_id: &str) -> SessionSpec {
        SessionSpec {
            session_id: Some(session_id.to_string()),
            user_id: Some(user_id.to_string()),
            client_type: Some("anthropic".to_string()),
            ..Default::default()
        }
    }

    async fn save_message(manager: &SessionManager, session_id: &str, content: &str) {
        let mut m = UniversalMessage::new(MessageRole::User, serde_json::json!(content));
        m.session_id = Some(session_id.to_string());
        manager.store().save_message(&m).await.unwrap();
    }

    #[test]
    fn session_id_carries_all_parts_in_order() {
        let manager = manager();
        let id = manager.generate_session_id(Some("u1"), Some("anthropic"), Some("my context"));
        assert!(id.starts_with("anthropic_u1_my_context_"));

        let segments: Vec<&str> = id.split('_').collect();
        // ... context, YYYYMMDD, HHMMSS, 8-hex
        let hex = segments.last().unwrap();
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));

        let bare = manager.generate_session_id(None, None, None);
        assert_eq!(bare.split('_').count(), 3);
    }

    #[test]
    fn forced_collisions_get_numeric_suffixes() {
        let manager = manager();
        manager
            .active
            .insert("x".to_string(), ConversationSession::new("x"));
        manager
            .active
            .insert("x_1".to_string(), ConversationSession::new("x_1"));

        assert_eq!(manager.dedupe_session_id("x".to_string()), "x_2");
        assert_eq!(manager.dedupe_session_id("y".to_string()), "y");
    }

    #[test]
    fn generated_ids_never_collide() {
        let manager = manager();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let id = manager.generate_session_id(Some("u"), Some("c"), None);
            assert!(seen.insert(id.clone()));
            manager.active.insert(id.clone(), ConversationSession::new(id));
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicates_unless_forced() {
        let manager = manager();
        manager.create_session(spec("s1", "u1")).await.unwrap();

        let err = manager.create_session(spec("s1", "u1")).await.unwrap_err();
        assert!(matches!(err, MemoryError::SessionExists(_)));

        let mut forced = spec("s1", "u2");
        forced.force_new = true;
        let session = manager.create_session(forced).await.unwrap();
        assert_eq!(session.user_id.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn concurrent_create_claim_is_reported_busy() {
        let manager = manager();
        manager.create_claims.insert("s1".to_string(), ());
        let err = manager.create_session(spec("s1", "u1")).await.unwrap_err();
        assert!(matches!(err, MemoryError::SessionBusy(_)));
    }

    #[tokio::test]
    async fn ensure_session_exists_is_idempotent() {
        let manager = manager();
        let first = manager
            .ensure_session_exists("s1", spec("s1", "u1"))
            .await
            .unwrap();
        let second = manager
            .ensure_session_exists("s1", spec("s1", "u1"))
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn clone_diverges_from_the_source() {
        let manager = manager();
        manager.create_session(spec("s1", "u1")).await.unwrap();
        for content in ["one", "two", "three"] {
            save_message(&manager, "s1", content).await;
        }

        let clone = manager
            .clone_session("s1", Some("s2".to_string()), None)
            .await
            .unwrap();
        assert_eq!(clone.session_id, "s2");
        assert_eq!(
            clone
                .session_metadata
                .as_ref()
                .unwrap()
                .get("cloned_from")
                .unwrap(),
            "s1"
        );

        save_message(&manager, "s2", "four").await;

        let source_history = manager
            .store()
            .get_conversation_history("s1", HistoryFilter::default())
            .await
            .unwrap();
        let clone_history = manager
            .store()
            .get_conversation_history("s2", HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(source_history.len(), 3);
        assert_eq!(clone_history.len(), 4);

        for (original, copy) in source_history.iter().zip(clone_history.iter()) {
            assert_eq!(original.content, copy.content);
            assert_ne!(original.message_id, copy.message_id);
            let provenance = copy.metadata.as_ref().unwrap();
            assert_eq!(
                provenance.get("cloned_from").unwrap(),
                &serde_json::json!(original.message_id)
            );
        }
    }

    #[tokio::test]
    async fn statistics_summarise_the_session() {
        let manager = manager();
        manager.create_session(spec("s1", "u1")).await.unwrap();

        let mut user = UniversalMessage::new(MessageRole::User, serde_json::json!("q"));
        user.session_id = Some("s1".to_string());
        user.provider = Some("anthropic".to_string());
        let mut assistant = UniversalMessage::new(MessageRole::Assistant, serde_json::json!("a"));
        assistant.session_id = Some("s1".to_string());
        assistant.provider = Some("anthropic".to_string());
        manager.store().save_message(&user).await.unwrap();
        manager.store().save_message(&assistant).await.unwrap();

        let stats = manager.get_session_statistics("s1").await.unwrap();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.role_distribution.get("user"), Some(&1));
        assert_eq!(stats.role_distribution.get("assistant"), Some(&1));
        assert_eq!(stats.message_types.get("text"), Some(&2));
        assert_eq!(stats.providers_used, vec!["anthropic".to_string()]);
        assert!(stats.session_size_bytes > 0);
    }

    #[tokio::test]
    async fn snapshot_contains_every_message() {
        let manager = manager();
        manager.create_session(spec("s1", "u1")).await.unwrap();
        save_message(&manager, "s1", "only").await;

        let snapshot = manager.session_snapshot("s1").await.unwrap();
        assert_eq!(snapshot.message_count, 1);
        assert_eq!(snapshot.session.session_id, "s1");
        assert_eq!(snapshot.messages[0].content, serde_json::json!("only"));
    }

    #[tokio::test]
    async fn cache_cleanup_evicts_inactive_entries() {
        let manager = manager();
        manager.create_session(spec("s1", "u1")).await.unwrap();
        if let Some(mut cached) = manager.active.get_mut("s1") {
            cached.last_activity = Utc::now() - Duration::hours(48);
        }

        assert_eq!(manager.cleanup_inactive_sessions(24), 1);
        assert!(manager.active.get("s1").is_none());
    }
}
