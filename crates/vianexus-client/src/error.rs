use thiserror::Error;

use crate::provider::ProviderError;
use vianexus_mcp::ChannelError;
use vianexus_memory::MemoryError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid question: {0}")]
    Validation(String),

    #[error("cannot detect LLM provider: {0}")]
    ProviderDetection(String),

    #[error("no tool channel: {0}")]
    NotConnected(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
