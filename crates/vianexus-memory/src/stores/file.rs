use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, warn};

use crate::error::{MemoryError, Result};
use crate::store::{
    apply_history_filter, content_matches, HistoryFilter, MemoryStore, SearchQuery, StoreStats,
};
use crate::types::{ConversationSession, UniversalMessage};

/// File-backed conversation storage. Sessions are single JSON documents under
/// `sessions/`, messages are append-only JSONL under `messages/`.
pub struct FileMemoryStore {
    sessions_dir: PathBuf,
    messages_dir: PathBuf,
}

impl FileMemoryStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let sessions_dir = root.join("sessions");
        let messages_dir = root.join("messages");
        fs::create_dir_all(&sessions_dir).await?;
        fs::create_dir_all(&messages_dir).await?;
        Ok(Self {
            sessions_dir,
            messages_dir,
        })
    }

    fn session_file(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.sessions_dir.join(format!("{session_id}.json")))
    }

    fn messages_file(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.messages_dir.join(format!("{session_id}.jsonl")))
    }

    /// Read every well-formed message line; corrupted lines are skipped.
    async fn read_messages(&self, session_id: &str) -> Result<Vec<UniversalMessage>> {
        let path = self.messages_file(session_id)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match UniversalMessage::from_json(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(session_id, error = %e, "skipping corrupted message line"),
            }
        }
        Ok(messages)
    }

    /// Session ids present on disk, derived from the session file names.
    async fn list_session_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }
}

/// Session ids become file names; reject anything that could escape the
/// storage directory.
fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty()
        || session_id.contains('/')
        || session_id.contains('\\')
        || session_id.contains("..")
    {
        return Err(MemoryError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn save_message(&self, message: &UniversalMessage) -> Result<bool> {
        let Some(session_id) = message.session_id.as_deref() else {
            error!("message has no session_id");
            return Ok(false);
        };

        let path = self.messages_file(session_id)?;
        let mut line = message.to_json()?;
        line.push('\n');

        // append-only open avoids torn rewrites of earlier messages
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(role = %message.role, session_id, "saved message to file");
        Ok(true)
    }

    async fn get_conversation_history(
        &self,
        session_id: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<UniversalMessage>> {
        let messages = self.read_messages(session_id).await?;
        Ok(apply_history_filter(messages, &filter))
    }

    async fn save_session(&self, session: &ConversationSession) -> Result<bool> {
        let path = self.session_file(&session.session_id)?;
        fs::write(&path, session.to_json()?).await?;
        debug!(session_id = %session.session_id, "saved session to file");
        Ok(true)
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ConversationSession>> {
        let path = self.session_file(session_id)?;
        let data = match fs::read_to_string(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match ConversationSession::from_json(&data) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                error!(session_id, error = %e, "corrupted session file");
                Ok(None)
            }
        }
    }

    async fn update_session_activity(&self, session_id: &str) -> Result<bool> {
        match self.get_session(session_id).await? {
            Some(mut session) => {
                session.update_activity();
                self.save_session(&session).await
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        remove_if_exists(&self.session_file(session_id)?).await?;
        remove_if_exists(&self.messages_file(session_id)?).await?;
        debug!(session_id, "deleted session files");
        Ok(true)
    }

    async fn search_messages(&self, query: &SearchQuery) -> Result<Vec<UniversalMessage>> {
        let query_lower = query.query.to_lowercase();

        let mut search_sessions = match &query.session_ids {
            Some(ids) => ids.clone(),
            None => self.list_session_ids().await?,
        };

        if let Some(user_id) = &query.user_id {
            let mut owned = Vec::new();
            for session_id in &search_sessions {
                if let Some(session) = self.get_session(session_id).await? {
                    if session.user_id.as_deref() == Some(user_id) {
                        owned.push(session_id.clone());
                    }
                }
            }
            search_sessions = owned;
        }

        let mut results = Vec::new();
        'sessions: for session_id in &search_sessions {
            for message in self.read_messages(session_id).await? {
                if content_matches(&message, &query_lower) {
                    results.push(message);
                    if results.len() >= query.limit {
                        break 'sessions;
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
        let mut removed = 0;

        for session_id in self.list_session_ids().await? {
            if let Some(session) = self.get_session(&session_id).await? {
                if session.last_activity < cutoff {
                    self.delete_session(&session_id).await?;
                    removed += 1;
                }
            }
        }

        debug!(count = removed, "cleaned up old sessions");
        Ok(removed)
    }

    async fn get_user_sessions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationSession>> {
        let mut sessions = Vec::new();
        for session_id in self.list_session_ids().await? {
            if let Some(session) = self.get_session(&session_id).await? {
                if session.user_id.as_deref() == Some(user_id) {
                    sessions.push(session);
                }
            }
        }

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        if let Some(limit) = limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let session_ids = self.list_session_ids().await?;
        let mut total_messages = 0;
        for session_id in &session_ids {
            total_messages += self.read_messages(session_id).await?.len();
        }
        Ok(StoreStats {
            total_sessions: session_ids.len(),
            total_messages,
        })
    }
}
