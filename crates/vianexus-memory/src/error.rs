use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("message has no session_id")]
    MissingSessionId,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("session {0} is currently being created")]
    SessionBusy(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
