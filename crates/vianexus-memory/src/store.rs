use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::types::{ConversationSession, MessageType, UniversalMessage};

/// Optional filters for [`MemoryStore::get_conversation_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Keep only the most-recent `limit` messages (after the other filters).
    pub limit: Option<usize>,
    /// Drop the named message and everything after it.
    pub before_message_id: Option<String>,
    pub message_types: Option<Vec<MessageType>>,
}

impl HistoryFilter {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// Parameters for [`MemoryStore::search_messages`].
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub user_id: Option<String>,
    /// Restrict the search to these sessions; all sessions when absent.
    pub session_ids: Option<Vec<String>>,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: None,
            session_ids: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_sessions: usize,
    pub total_messages: usize,
}

/// Client-agnostic conversation storage contract.
///
/// Missing sessions yield empty/`None` results rather than errors;
/// `save_message` is atomic at message granularity.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn save_message(&self, message: &UniversalMessage) -> Result<bool>;

    /// Ordered oldest → newest within a session (append order).
    async fn get_conversation_history(
        &self,
        session_id: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<UniversalMessage>>;

    async fn save_session(&self, session: &ConversationSession) -> Result<bool>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ConversationSession>>;

    /// Returns `false` when the session does not exist.
    async fn update_session_activity(&self, session_id: &str) -> Result<bool>;

    /// Cascades: every message owned by the session is removed too.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    /// Case-insensitive substring search over stringified content,
    /// newest first.
    async fn search_messages(&self, query: &SearchQuery) -> Result<Vec<UniversalMessage>>;

    /// Delete sessions whose last activity is older than the cutoff.
    /// Returns the number removed.
    async fn cleanup_old_sessions(&self, older_than_days: i64) -> Result<usize>;

    /// Sessions for a user, most recently active first.
    async fn get_user_sessions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationSession>>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Shared filter application for store implementations: type filter, then the
/// `before_message_id` cut, then the trailing-limit window.
pub(crate) fn apply_history_filter(
    mut messages: Vec<UniversalMessage>,
    filter: &HistoryFilter,
) -> Vec<UniversalMessage> {
    if let Some(types) = &filter.message_types {
        messages.retain(|m| types.contains(&m.message_type));
    }
    if let Some(before) = &filter.before_message_id {
        if let Some(cut) = messages.iter().position(|m| &m.message_id == before) {
            messages.truncate(cut);
        }
    }
    if let Some(limit) = filter.limit {
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
    }
    messages
}

/// Case-insensitive substring match against a message's stringified content.
pub(crate) fn content_matches(message: &UniversalMessage, query_lower: &str) -> bool {
    message
        .content
        .to_string()
        .to_lowercase()
        .contains(query_lower)
}
