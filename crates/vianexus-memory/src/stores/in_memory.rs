use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, error};

use crate::error::Result;
use crate::store::{
    apply_history_filter, content_matches, HistoryFilter, MemoryStore, SearchQuery, StoreStats,
};
use crate::types::{ConversationSession, UniversalMessage};

/// In-process storage for conversations. Fast, no persistence — intended for
/// development, tests and short-lived interactions.
#[derive(Default)]
pub struct InMemoryStore {
    /// session_id → ordered message list (append order).
    messages: DashMap<String, Vec<UniversalMessage>>,
    /// session_id → session record.
    sessions: DashMap<String, ConversationSession>,
    /// user_id → session ids.
    user_sessions: DashMap<String, Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn save_message(&self, message: &UniversalMessage) -> Result<bool> {
        let Some(session_id) = message.session_id.as_deref() else {
            error!("message has no session_id");
            return Ok(false);
        };

        self.messages
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());

        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.message_count += 1;
        }

        debug!(role = %message.role, session_id, "saved message to in-memory store");
        Ok(true)
    }

    async fn get_conversation_history(
        &self,
        session_id: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<UniversalMessage>> {
        let messages = self
            .messages
            .get(session_id)
            .map(|m| m.value().clone())
            .unwrap_or_default();
        Ok(apply_history_filter(messages, &filter))
    }

    async fn save_session(&self, session: &ConversationSession) -> Result<bool> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());

        if let Some(user_id) = &session.user_id {
            let mut ids = self.user_sessions.entry(user_id.clone()).or_default();
            if !ids.contains(&session.session_id) {
                ids.push(session.session_id.clone());
            }
        }

        debug!(session_id = %session.session_id, "saved session to in-memory store");
        Ok(true)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ConversationSession>> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn update_session_activity(&self, session_id: &str) -> Result<bool> {
        match self.sessions.get_mut(session_id) {
            Some(mut session) => {
                session.update_activity();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.messages.remove(session_id);
        let removed = self.sessions.remove(session_id);

        if let Some((_, session)) = removed {
            if let Some(user_id) = &session.user_id {
                if let Some(mut ids) = self.user_sessions.get_mut(user_id) {
                    ids.retain(|id| id != session_id);
                }
            }
        }

        debug!(session_id, "deleted session from in-memory store");
        Ok(true)
    }

    async fn search_messages(&self, query: &SearchQuery) -> Result<Vec<UniversalMessage>> {
        let query_lower = query.query.to_lowercase();

        let mut search_sessions: Vec<String> = match &query.session_ids {
            Some(ids) => ids.clone(),
            None => self.messages.iter().map(|e| e.key().clone()).collect(),
        };

        if let Some(user_id) = &query.user_id {
            let owned: Vec<String> = self
                .user_sessions
                .get(user_id)
                .map(|ids| ids.value().clone())
                .unwrap_or_default();
            search_sessions.retain(|id| owned.contains(id));
        }

        let mut results = Vec::new();
        'sessions: for session_id in &search_sessions {
            if let Some(messages) = self.messages.get(session_id) {
                for message in messages.iter() {
                    if content_matches(message, &query_lower) {
                        results.push(message.clone());
                        if results.len() >= query.limit {
                            break 'sessions;
                        }
                    }
                }
            }
        }

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        results.truncate(query.limit);
        debug!(count = results.len(), "search found messages");
        Ok(results)
    }

    async fn cleanup_old_sessions(&self, older_than_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.last_activity < cutoff)
            .map(|e| e.key().clone())
            .collect();

        for session_id in &stale {
            self.delete_session(session_id).await?;
        }

        debug!(count = stale.len(), "cleaned up old sessions");
        Ok(stale.len())
    }

    async fn get_user_sessions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationSession>> {
        let ids: Vec<String> = self
            .user_sessions
            .get(user_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();

        let mut sessions: Vec<ConversationSession> = ids
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|s| s.value().clone()))
            .collect();

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            total_sessions: self.sessions.len(),
            total_messages: self.messages.iter().map(|e| e.len()).sum(),
        })
    }
}
