use serde_json::{json, Value};

use crate::types::{MessageRole, MessageType, UniversalMessage};

/// Converts between one provider's message shape and [`UniversalMessage`].
///
/// Converters round-trip losslessly for messages originating from their own
/// provider (via `raw_content`) and produce a valid minimal provider shape
/// for messages synthesized by another provider.
pub trait MessageConverter: Send + Sync {
    fn provider(&self) -> &'static str;

    fn to_universal(&self, provider_message: &Value) -> UniversalMessage;

    fn from_universal(&self, message: &UniversalMessage) -> Value;

    fn to_universal_batch(&self, provider_messages: &[Value]) -> Vec<UniversalMessage> {
        provider_messages
            .iter()
            .map(|m| self.to_universal(m))
            .collect()
    }

    fn from_universal_batch(&self, messages: &[UniversalMessage]) -> Vec<Value> {
        messages.iter().map(|m| self.from_universal(m)).collect()
    }

    /// Searchable plain text for a provider message: text blocks concatenated,
    /// `[Tool: <name>]` / `[Tool Result]` placeholders for non-text blocks.
    fn extract_text_content(&self, provider_message: &Value) -> String {
        blocks_to_text(provider_message.get("content").unwrap_or(&Value::Null))
    }
}

/// Look up the process-immutable converter set.
pub fn converter_for(provider: &str) -> Option<&'static dyn MessageConverter> {
    static ANTHROPIC: AnthropicConverter = AnthropicConverter;
    static OPENAI: OpenAiConverter = OpenAiConverter;
    static GEMINI: GeminiConverter = GeminiConverter;
    match provider {
        "anthropic" => Some(&ANTHROPIC),
        "openai" => Some(&OPENAI),
        "gemini" => Some(&GEMINI),
        _ => None,
    }
}

pub fn registered_providers() -> &'static [&'static str] {
    &["anthropic", "openai", "gemini"]
}

/// Plain text from a content value: strings pass through, block arrays are
/// concatenated with tool placeholders.
pub fn blocks_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    Value::String(s) => parts.push(s.clone()),
                    Value::Object(map) => match map.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = map.get("text").and_then(Value::as_str) {
                                parts.push(text.to_string());
                            }
                        }
                        Some("tool_use") => {
                            let name = map
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown_tool");
                            parts.push(format!("[Tool: {name}]"));
                        }
                        Some("tool_result") => parts.push("[Tool Result]".to_string()),
                        _ => {
                            // Gemini-style parts have no "type" discriminator
                            if let Some(text) = map.get("text").and_then(Value::as_str) {
                                parts.push(text.to_string());
                            } else if let Some(call) = map.get("functionCall") {
                                let name = call
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown_tool");
                                parts.push(format!("[Tool: {name}]"));
                            } else if map.contains_key("functionResponse") {
                                parts.push("[Tool Result]".to_string());
                            }
                        }
                    },
                    _ => {}
                }
            }
            parts.join(" ")
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Plain text for a universal message, used when rendering a message that
/// originated on a different provider.
pub fn universal_text(message: &UniversalMessage) -> String {
    blocks_to_text(&message.content)
}

fn parse_role(value: Option<&Value>) -> MessageRole {
    value
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(MessageRole::User)
}

// ── Anthropic ────────────────────────────────────────────────────────────────

pub struct AnthropicConverter;

impl MessageConverter for AnthropicConverter {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    fn to_universal(&self, provider_message: &Value) -> UniversalMessage {
        let role = parse_role(provider_message.get("role"));
        let content = provider_message
            .get("content")
            .cloned()
            .unwrap_or(Value::Null);

        let mut message = UniversalMessage::new(role, content.clone());
        message.message_type = UniversalMessage::detect_message_type(&content);
        message.provider = Some("anthropic".to_string());
        message.raw_content = Some(provider_message.clone());

        if let Some(blocks) = content.as_array() {
            let collect = |t: &str| -> Vec<Value> {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some(t))
                    .cloned()
                    .collect()
            };
            match message.message_type {
                MessageType::ToolCall => message.tool_calls = Some(collect("tool_use")),
                MessageType::ToolResult => message.tool_results = Some(collect("tool_result")),
                _ => {}
            }
        }
        message
    }

    fn from_universal(&self, message: &UniversalMessage) -> Value {
        if message.provider.as_deref() == Some("anthropic") {
            if let Some(raw) = &message.raw_content {
                if raw.is_object() {
                    return raw.clone();
                }
            }
        }
        json!({
            "role": message.role.to_string(),
            "content": message.content,
        })
    }
}

// ── OpenAI ───────────────────────────────────────────────────────────────────

pub struct OpenAiConverter;

impl MessageConverter for OpenAiConverter {
    fn provider(&self) -> &'static str {
        "openai"
    }

    fn to_universal(&self, provider_message: &Value) -> UniversalMessage {
        let role = parse_role(provider_message.get("role"));
        let content = provider_message
            .get("content")
            .cloned()
            .unwrap_or(Value::Null);

        let mut message = UniversalMessage::new(role, content);
        message.provider = Some("openai".to_string());
        message.raw_content = Some(provider_message.clone());

        if let Some(calls) = provider_message.get("tool_calls").and_then(Value::as_array) {
            message.message_type = MessageType::ToolCall;
            message.tool_calls = Some(calls.clone());
        } else if role == MessageRole::Tool {
            message.message_type = MessageType::ToolResult;
        }
        message
    }

    fn from_universal(&self, message: &UniversalMessage) -> Value {
        if message.provider.as_deref() == Some("openai") {
            if let Some(raw) = &message.raw_content {
                if raw.is_object() {
                    return raw.clone();
                }
            }
        }
        let role = match message.role {
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool | MessageRole::Function => "tool",
            MessageRole::User => "user",
        };
        json!({
            "role": role,
            "content": universal_text(message),
        })
    }
}

// ── Gemini ───────────────────────────────────────────────────────────────────

pub struct GeminiConverter;

impl MessageConverter for GeminiConverter {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    fn to_universal(&self, provider_message: &Value) -> UniversalMessage {
        let role = match provider_message.get("role").and_then(Value::as_str) {
            Some("model") => MessageRole::Assistant,
            _ => MessageRole::User,
        };
        let parts = provider_message
            .get("parts")
            .cloned()
            .unwrap_or(Value::Null);

        let mut message = UniversalMessage::new(role, parts.clone());
        message.provider = Some("gemini".to_string());
        message.raw_content = Some(provider_message.clone());

        if let Some(parts) = parts.as_array() {
            let calls: Vec<Value> = parts
                .iter()
                .filter(|p| p.get("functionCall").is_some())
                .cloned()
                .collect();
            let responses: Vec<Value> = parts
                .iter()
                .filter(|p| p.get("functionResponse").is_some())
                .cloned()
                .collect();
            if !calls.is_empty() {
                message.message_type = MessageType::ToolCall;
                message.tool_calls = Some(calls);
            } else if !responses.is_empty() {
                message.message_type = MessageType::ToolResult;
                message.tool_results = Some(responses);
            }
        }
        message
    }

    fn from_universal(&self, message: &UniversalMessage) -> Value {
        if message.provider.as_deref() == Some("gemini") {
            if let Some(raw) = &message.raw_content {
                if raw.is_object() {
                    return raw.clone();
                }
            }
        }
        let role = match message.role {
            MessageRole::Assistant => "model",
            _ => "user",
        };
        json!({
            "role": role,
            "parts": [{"text": universal_text(message)}],
        })
    }

    fn extract_text_content(&self, provider_message: &Value) -> String {
        blocks_to_text(provider_message.get("parts").unwrap_or(&Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_all_three_providers() {
        for provider in registered_providers() {
            let converter = converter_for(provider).unwrap();
            assert_eq!(converter.provider(), *provider);
        }
        assert!(converter_for("cohere").is_none());
    }

    #[test]
    fn anthropic_classifies_tool_use_blocks() {
        let converter = AnthropicConverter;
        let msg = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "t1", "name": "fetch", "input": {"symbol": "V"}}
            ]
        });

        let universal = converter.to_universal(&msg);
        assert_eq!(universal.role, MessageRole::Assistant);
        assert_eq!(universal.message_type, MessageType::ToolCall);
        assert_eq!(universal.tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(universal.provider.as_deref(), Some("anthropic"));
    }

    #[test]
    fn anthropic_classifies_tool_result_blocks() {
        let converter = AnthropicConverter;
        let msg = json!({
            "role": "user",
            "content": [{"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "42"}]}]
        });

        let universal = converter.to_universal(&msg);
        assert_eq!(universal.message_type, MessageType::ToolResult);
        assert_eq!(universal.tool_results.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn same_provider_round_trip_is_lossless() {
        let converter = AnthropicConverter;
        let msg = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "t1", "name": "fetch", "input": {"a": 1}}
            ]
        });

        let restored = converter.from_universal(&converter.to_universal(&msg));
        assert_eq!(restored, msg);
    }

    #[test]
    fn foreign_messages_get_a_minimal_shape() {
        let anthropic = AnthropicConverter;
        let gemini = GeminiConverter;

        let universal = anthropic.to_universal(&json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "the quote is 42"}]
        }));

        let gemini_shape = gemini.from_universal(&universal);
        assert_eq!(gemini_shape["role"], "model");
        assert_eq!(gemini_shape["parts"][0]["text"], "the quote is 42");
        assert_eq!(gemini.extract_text_content(&gemini_shape), "the quote is 42");
    }

    #[test]
    fn extract_text_inserts_tool_placeholders() {
        let converter = AnthropicConverter;
        let msg = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "t1", "name": "fetch", "input": {}},
                {"type": "tool_result", "tool_use_id": "t1", "content": []}
            ]
        });
        assert_eq!(
            converter.extract_text_content(&msg),
            "checking [Tool: fetch] [Tool Result]"
        );
    }

    #[test]
    fn openai_tool_calls_classify() {
        let converter = OpenAiConverter;
        let msg = json!({
            "role": "assistant",
            "content": Value::Null,
            "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "fetch", "arguments": "{}"}}]
        });
        let universal = converter.to_universal(&msg);
        assert_eq!(universal.message_type, MessageType::ToolCall);

        let tool_msg = json!({"role": "tool", "tool_call_id": "c1", "content": "42"});
        assert_eq!(
            converter.to_universal(&tool_msg).message_type,
            MessageType::ToolResult
        );
    }

    #[test]
    fn gemini_parts_classify() {
        let converter = GeminiConverter;
        let call = json!({
            "role": "model",
            "parts": [{"functionCall": {"name": "fetch", "args": {"symbol": "V"}}}]
        });
        let universal = converter.to_universal(&call);
        assert_eq!(universal.role, MessageRole::Assistant);
        assert_eq!(universal.message_type, MessageType::ToolCall);

        let response = json!({
            "role": "user",
            "parts": [{"functionResponse": {"name": "fetch", "response": {"result": "42"}}}]
        });
        assert_eq!(
            converter.to_universal(&response).message_type,
            MessageType::ToolResult
        );
    }

    #[test]
    fn batch_variants_preserve_length_and_order() {
        let converter = AnthropicConverter;
        let msgs = vec![
            json!({"role": "user", "content": "one"}),
            json!({"role": "assistant", "content": "two"}),
        ];
        let universal = converter.to_universal_batch(&msgs);
        assert_eq!(universal.len(), 2);
        let back = converter.from_universal_batch(&universal);
        assert_eq!(back, msgs);
    }
}
