use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("auth setup failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tool server error ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport session id not provided by server")]
    MissingSessionId,

    #[error("tool channel not connected")]
    NotConnected,

    /// Teardown raced task cancellation. Absorbed by the tolerant close path.
    #[error("operation cancelled during teardown: {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
