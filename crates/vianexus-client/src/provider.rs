use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use vianexus_mcp::ToolDescriptor;

/// One request to a vendor model: the canonical conversation buffer plus the
/// per-turn tool catalogue.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub system: String,
    /// Canonical messages (Anthropic-style content blocks). Backends
    /// translate to their native wire shape, preserving tool-call records
    /// for every provider.
    pub messages: Vec<Value>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: u32,
}

/// Parsed assistant reply in canonical form.
#[derive(Debug, Clone)]
pub struct TurnReply {
    /// Concatenated text blocks.
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    /// Full assistant block list, tool-call blocks included — this is what a
    /// subsequent request must echo back.
    pub assistant_blocks: Vec<Value>,
    pub stop_reason: String,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Provider-assigned tool-call identifier, unique within a turn.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Result of dispatching one invocation; `text` begins with `Error` whenever
/// `is_error` is set.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub invocation_id: String,
    pub name: String,
    pub text: String,
    pub is_error: bool,
    pub truncated_bytes: usize,
}

impl ToolOutcome {
    pub fn error(invocation: &ToolInvocation, text: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation.id.clone(),
            name: invocation.name.clone(),
            text: text.into(),
            is_error: true,
            truncated_bytes: 0,
        }
    }
}

/// One vendor model behind the orchestration loop.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider name for logging and persistence ("anthropic", ...).
    fn name(&self) -> &'static str;

    async fn send(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError>;

    /// Streaming variant: textual deltas are flushed to stdout as they
    /// arrive. Default falls back to the buffered path.
    async fn send_stream(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        self.send(request).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}
