use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;

/// Universal message roles across all LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
    /// OpenAI legacy function-calling compatibility.
    Function,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
            Self::Function => write!(f, "function"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            "function" => Ok(Self::Function),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// Message categorisation for filtering and search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    ToolCall,
    ToolResult,
    Image,
    Audio,
    Multimodal,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::ToolResult => write!(f, "tool_result"),
            Self::Image => write!(f, "image"),
            Self::Audio => write!(f, "audio"),
            Self::Multimodal => write!(f, "multimodal"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "image" => Ok(Self::Image),
            "audio" => Ok(Self::Audio),
            "multimodal" => Ok(Self::Multimodal),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Provider-agnostic message format. Converted to/from specific provider
/// shapes by the converters in [`crate::convert`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalMessage {
    pub role: MessageRole,
    /// Flexible content — plain text, structured block list, multimodal.
    pub content: Value,
    #[serde(default)]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Originating adapter name ("anthropic", "openai", "gemini").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Verbatim provider payload for lossless same-provider round trips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    /// Tool-call records extracted from `content` for fast filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl UniversalMessage {
    /// New message with a fresh id and the current timestamp.
    pub fn new(role: MessageRole, content: Value) -> Self {
        Self {
            role,
            content,
            message_type: MessageType::Text,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
            session_id: None,
            provider: None,
            raw_content: None,
            token_count: None,
            tool_calls: None,
            tool_results: None,
            user_id: None,
            context_tags: None,
            metadata: None,
        }
    }

    /// Classify a content value by the block types it carries.
    pub fn detect_message_type(content: &Value) -> MessageType {
        let Some(blocks) = content.as_array() else {
            return MessageType::Text;
        };
        let has_block = |t: &str| {
            blocks
                .iter()
                .any(|b| b.get("type").and_then(Value::as_str) == Some(t))
        };
        if has_block("tool_use") {
            MessageType::ToolCall
        } else if has_block("tool_result") {
            MessageType::ToolResult
        } else {
            MessageType::Text
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Metadata for an ordered sequence of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Cached count — the authoritative number comes from the message listing.
    #[serde(default)]
    pub message_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u32>,
    /// "fifo" today; "priority" and "semantic" are reserved.
    #[serde(default = "default_memory_strategy")]
    pub memory_strategy: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_metadata: Option<Map<String, Value>>,
}

fn default_memory_strategy() -> String {
    "fifo".to_string()
}

impl ConversationSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: None,
            client_type: None,
            system_prompt: None,
            created_at: now,
            last_activity: now,
            message_count: 0,
            max_context_length: None,
            memory_strategy: default_memory_strategy(),
            context_tags: None,
            session_metadata: None,
        }
    }

    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
