use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::convert::{converter_for, MessageConverter};
use crate::error::Result;
use crate::session::{SessionManager, SessionSpec, SessionStatistics};
use crate::store::{HistoryFilter, MemoryStore, SearchQuery};
use crate::types::{ConversationSession, MessageRole, MessageType, UniversalMessage};

/// Memory policies applied by the facade.
#[derive(Debug, Clone)]
pub struct MemoryPolicy {
    /// Default window for history loads when the caller gives no limit.
    pub max_context_messages: usize,
    pub retention_days: i64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            max_context_messages: 1000,
            retention_days: 30,
        }
    }
}

/// The single memory API consumed by provider clients: session lifecycle,
/// message persistence, history loads and search, scoped to one session.
pub struct ConversationMemory {
    store: Arc<dyn MemoryStore>,
    manager: SessionManager,
    session_id: Option<String>,
    user_id: Option<String>,
    provider_name: String,
    converter: Option<&'static dyn MessageConverter>,
    policy: MemoryPolicy,
    initialized: bool,
    current_session: Option<ConversationSession>,
    /// Transport session id recorded into session metadata for diagnostics.
    /// Never used as a session key.
    transport_session_id: Option<String>,
}

impl ConversationMemory {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        session_id: Option<String>,
        user_id: Option<String>,
        provider_name: impl Into<String>,
    ) -> Self {
        let provider_name = provider_name.into();
        Self {
            manager: SessionManager::new(store.clone()),
            store,
            session_id,
            user_id,
            converter: converter_for(&provider_name),
            provider_name,
            policy: MemoryPolicy::default(),
            initialized: false,
            current_session: None,
            transport_session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub fn policy_mut(&mut self) -> &mut MemoryPolicy {
        &mut self.policy
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn set_transport_session_id(&mut self, transport_session_id: impl Into<String>) {
        self.transport_session_id = Some(transport_session_id.into());
    }

    /// Assign a session id without touching storage. Used by eager clients
    /// that want a non-null id at construction time.
    pub fn preassign_session_id(&mut self, context: Option<&str>) -> &str {
        if self.session_id.is_none() {
            self.session_id = Some(self.manager.generate_session_id(
                self.user_id.as_deref(),
                Some(self.provider_name.as_str()),
                context,
            ));
        }
        self.session_id.as_deref().unwrap_or_default()
    }

    /// Create or resume the session. Idempotent after the first success.
    pub async fn initialize_session(&mut self, system_prompt: Option<&str>) -> Result<bool> {
        if self.initialized {
            return Ok(true);
        }

        if self.session_id.is_none() {
            self.session_id = Some(self.manager.generate_session_id(
                self.user_id.as_deref(),
                Some(self.provider_name.as_str()),
                None,
            ));
        }
        let session_id = self.session_id.clone().unwrap_or_default();

        let mut metadata = Map::new();
        if let Some(transport_id) = &self.transport_session_id {
            metadata.insert("mcp_session_id".to_string(), json!(transport_id));
            metadata.insert(
                "mcp_session_correlation".to_string(),
                json!(format!("memory:{session_id} <-> mcp:{transport_id}")),
            );
            debug!(
                memory_session = %session_id,
                mcp_session = %transport_id,
                "correlating memory session with MCP session"
            );
        }

        let session = self
            .manager
            .ensure_session_exists(
                &session_id,
                SessionSpec {
                    user_id: self.user_id.clone(),
                    client_type: Some(self.provider_name.clone()),
                    system_prompt: system_prompt.map(str::to_string),
                    session_metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        self.current_session = Some(session);
        self.initialized = true;
        info!(session_id = %session_id, "initialized isolated session");
        Ok(true)
    }

    /// Persist one message. Ensures the session exists, saves, then bumps
    /// session activity. Failures are logged and reported as `false` so a
    /// turn already in flight never aborts on a storage problem.
    pub async fn save(
        &mut self,
        role: MessageRole,
        content: Value,
        message_type: Option<MessageType>,
        metadata: Option<Map<String, Value>>,
    ) -> bool {
        if let Err(e) = self.initialize_session(None).await {
            error!(error = %e, "failed to initialize memory session");
            return false;
        }

        let message_type =
            message_type.unwrap_or_else(|| UniversalMessage::detect_message_type(&content));

        let mut message = UniversalMessage::new(role, content);
        message.message_type = message_type;
        message.session_id = self.session_id.clone();
        message.user_id = self.user_id.clone();
        message.provider = Some(self.provider_name.clone());
        message.metadata = metadata;

        let saved = match self.store.save_message(&message).await {
            Ok(saved) => saved,
            Err(e) => {
                error!(error = %e, "failed to save message to memory");
                return false;
            }
        };

        if saved {
            if let Some(session_id) = &self.session_id {
                if let Err(e) = self.store.update_session_activity(session_id).await {
                    warn!(error = %e, "failed to update session activity");
                }
            }
            debug!(role = %role, "saved message to memory");
        }
        saved
    }

    /// Conversation history in universal form, oldest first.
    pub async fn load_history(
        &mut self,
        limit: Option<usize>,
        message_types: Option<Vec<MessageType>>,
    ) -> Vec<UniversalMessage> {
        if self.initialize_session(None).await.is_err() {
            return Vec::new();
        }
        let Some(session_id) = self.session_id.clone() else {
            return Vec::new();
        };

        let filter = HistoryFilter {
            limit: Some(limit.unwrap_or(self.policy.max_context_messages)),
            before_message_id: None,
            message_types,
        };
        match self.store.get_conversation_history(&session_id, filter).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "failed to load conversation history");
                Vec::new()
            }
        }
    }

    /// History rendered through this provider's converter. Falls back to the
    /// universal JSON form when no converter is registered.
    pub async fn load_history_in_provider_format(
        &mut self,
        limit: Option<usize>,
        message_types: Option<Vec<MessageType>>,
    ) -> Vec<Value> {
        let messages = self.load_history(limit, message_types).await;
        match self.converter {
            Some(converter) => converter.from_universal_batch(&messages),
            None => messages
                .iter()
                .filter_map(|m| serde_json::to_value(m).ok())
                .collect(),
        }
    }

    /// Search this session, or every session of the user when
    /// `all_user_sessions` is set. Newest first.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        all_user_sessions: bool,
    ) -> Vec<UniversalMessage> {
        let session_ids = if all_user_sessions {
            None
        } else {
            self.session_id.clone().map(|id| vec![id])
        };

        let search = SearchQuery {
            query: query.to_string(),
            user_id: self.user_id.clone(),
            session_ids,
            limit,
        };
        match self.store.search_messages(&search).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "failed to search conversations");
                Vec::new()
            }
        }
    }

    /// Point the facade at a different session.
    pub async fn switch_session(&mut self, new_session_id: &str, create_if_not_exists: bool) -> bool {
        let session = if create_if_not_exists {
            self.manager
                .ensure_session_exists(
                    new_session_id,
                    SessionSpec {
                        user_id: self.user_id.clone(),
                        client_type: Some(self.provider_name.clone()),
                        ..Default::default()
                    },
                )
                .await
        } else {
            match self.manager.get_session(new_session_id).await {
                Ok(Some(session)) => Ok(session),
                Ok(None) => {
                    error!(session_id = new_session_id, "session does not exist");
                    return false;
                }
                Err(e) => Err(e),
            }
        };

        match session {
            Ok(session) => {
                let old = self.session_id.replace(new_session_id.to_string());
                self.current_session = Some(session);
                self.initialized = true;
                info!(
                    from = old.as_deref().unwrap_or("<none>"),
                    to = new_session_id,
                    "switched session"
                );
                true
            }
            Err(e) => {
                error!(error = %e, "failed to switch session");
                false
            }
        }
    }

    /// Delete the current session and all its messages.
    pub async fn clear_session(&mut self) -> bool {
        let Some(session_id) = self.session_id.clone() else {
            return true;
        };
        match self.store.delete_session(&session_id).await {
            Ok(deleted) => {
                if deleted {
                    self.initialized = false;
                    self.current_session = None;
                    info!(session_id = %session_id, "cleared memory session");
                }
                deleted
            }
            Err(e) => {
                error!(error = %e, "failed to clear session");
                false
            }
        }
    }

    pub async fn user_sessions(&self, limit: Option<usize>) -> Vec<ConversationSession> {
        let Some(user_id) = self.user_id.as_deref() else {
            return Vec::new();
        };
        match self.store.get_user_sessions(user_id, limit).await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "failed to get user sessions");
                Vec::new()
            }
        }
    }

    pub async fn clone_current_session(&self, new_user_id: Option<String>) -> Result<String> {
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| crate::MemoryError::SessionNotFound("<unset>".to_string()))?;
        let clone = self
            .manager
            .clone_session(&session_id, None, new_user_id)
            .await?;
        Ok(clone.session_id)
    }

    pub async fn statistics(&self) -> Option<SessionStatistics> {
        let session_id = self.session_id.as_deref()?;
        self.manager.get_session_statistics(session_id).await.ok()
    }

    pub async fn cleanup_old_sessions(&self, older_than_days: i64) -> usize {
        match self.store.cleanup_old_sessions(older_than_days).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "failed to cleanup old sessions");
                0
            }
        }
    }

    /// Current session facts for diagnostics.
    pub fn session_info(&self) -> Value {
        json!({
            "memory_session_id": self.session_id,
            "user_id": self.user_id,
            "provider": self.provider_name,
            "session_initialized": self.initialized,
            "has_converter": self.converter.is_some(),
            "mcp_session_id": self.transport_session_id,
        })
    }
}
