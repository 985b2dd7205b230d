use std::collections::BTreeMap;
use std::io::Write;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::{ModelBackend, ProviderError, ToolInvocation, TurnReply, TurnRequest};
use crate::sse::{parse_sse_line, LineBuffer, SseLine};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiBackend {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn send(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        let body = build_request_body(request, false);
        debug!(model = %request.model, "sending request to OpenAI");

        let resp = Self::check_status(self.request(&body).send().await?).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn send_stream(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        let body = build_request_body(request, true);
        debug!(model = %request.model, "sending streaming request to OpenAI");

        let resp = Self::check_status(self.request(&body).send().await?).await?;
        collect_stream(resp).await
    }
}

fn build_request_body(request: &TurnRequest, stream: bool) -> Value {
    // system message first, then the canonical buffer translated to the
    // chat-completions shape
    let mut messages = vec![json!({"role": "system", "content": request.system})];
    for message in &request.messages {
        messages.extend(convert_canonical_message(message));
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "stream": stream,
    });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": normalize_schema(&t.input_schema),
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Tool parameters must be an object schema; anything else collapses to the
/// empty object schema.
fn normalize_schema(schema: &Value) -> Value {
    if schema.get("type").and_then(Value::as_str) == Some("object") {
        schema.clone()
    } else {
        json!({"type": "object", "properties": {}})
    }
}

/// Translate one canonical message into one or more chat-completions
/// messages. Assistant `tool_use` blocks become `tool_calls`; `tool_result`
/// blocks become separate `tool` role messages.
fn convert_canonical_message(message: &Value) -> Vec<Value> {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
    let Some(blocks) = message.get("content").and_then(Value::as_array) else {
        return vec![message.clone()];
    };

    let has = |t: &str| {
        blocks
            .iter()
            .any(|b| b.get("type").and_then(Value::as_str) == Some(t))
    };

    if role == "assistant" && has("tool_use") {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text_parts.push(t.to_string());
                    }
                }
                Some("tool_use") => {
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(json!({
                        "id": block.get("id").and_then(Value::as_str).unwrap_or("call_0"),
                        "type": "function",
                        "function": {
                            "name": block.get("name").and_then(Value::as_str).unwrap_or("unknown"),
                            "arguments": input.to_string(),
                        }
                    }));
                }
                _ => {}
            }
        }

        let content = if text_parts.is_empty() {
            Value::Null
        } else {
            json!(text_parts.join("\n"))
        };
        vec![json!({
            "role": "assistant",
            "content": content,
            "tool_calls": tool_calls,
        })]
    } else if has("tool_result") {
        blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|b| {
                json!({
                    "role": "tool",
                    "tool_call_id": b.get("tool_use_id").and_then(Value::as_str).unwrap_or("call_0"),
                    "content": tool_result_text(b),
                })
            })
            .collect()
    } else {
        let text: String = blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        vec![json!({"role": role, "content": text})]
    }
}

/// Text payload of a canonical tool_result block (its content is a list of
/// text blocks, or occasionally a bare string).
pub(crate) fn tool_result_text(block: &Value) -> String {
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn parse_response(resp: ApiResponse) -> TurnReply {
    let choice = resp.choices.into_iter().next();
    let text = choice
        .as_ref()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();

    let tool_calls: Vec<ToolInvocation> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| calls.iter().map(invocation_from_call).collect())
        .unwrap_or_default();

    let stop_reason = choice.and_then(|c| c.finish_reason).unwrap_or_default();
    build_reply(text, tool_calls, stop_reason)
}

fn invocation_from_call(call: &ApiToolCall) -> ToolInvocation {
    ToolInvocation {
        id: call.id.clone(),
        name: call.function.name.clone(),
        arguments: serde_json::from_str(&call.function.arguments).unwrap_or_default(),
    }
}

/// Canonical assistant blocks from the parsed reply, so the buffer keeps
/// tool-call records in the same shape for every provider.
fn build_reply(text: String, tool_calls: Vec<ToolInvocation>, stop_reason: String) -> TurnReply {
    let mut blocks = Vec::new();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in &tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        }));
    }

    TurnReply {
        text,
        tool_calls,
        assistant_blocks: blocks,
        stop_reason,
    }
}

/// Consume an SSE stream: print text deltas, assemble tool-call fragments by
/// index until `[DONE]`.
async fn collect_stream(resp: reqwest::Response) -> Result<TurnReply, ProviderError> {
    #[derive(Default)]
    struct PendingCall {
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    }

    let mut text = String::new();
    let mut pending: BTreeMap<u64, PendingCall> = BTreeMap::new();
    let mut stop_reason = String::new();
    let mut lines = LineBuffer::default();

    let mut byte_stream = resp.bytes_stream();
    'stream: while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProviderError::Http)?;
        let Ok(chunk_text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        for line in lines.push(chunk_text) {
            let Some(SseLine::Data(data)) = parse_sse_line(&line) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break 'stream;
            }
            let Ok(parsed) = serde_json::from_str::<StreamChunk>(&data) else {
                continue;
            };

            for choice in &parsed.choices {
                if let Some(reason) = &choice.finish_reason {
                    if !reason.is_empty() {
                        stop_reason = reason.clone();
                    }
                }
                if let Some(delta_text) = &choice.delta.content {
                    if !delta_text.is_empty() {
                        print!("{delta_text}");
                        let _ = std::io::stdout().flush();
                        text.push_str(delta_text);
                    }
                }
                for fragment in choice.delta.tool_calls.iter().flatten() {
                    let slot = pending.entry(fragment.index).or_default();
                    if let Some(id) = &fragment.id {
                        slot.id = Some(id.clone());
                    }
                    if let Some(function) = &fragment.function {
                        if let Some(name) = &function.name {
                            slot.name = Some(name.clone());
                        }
                        if let Some(arguments) = &function.arguments {
                            slot.arguments.push_str(arguments);
                        }
                    }
                }
            }
        }
    }

    // only complete calls (id + name) are dispatched
    let tool_calls: Vec<ToolInvocation> = pending
        .into_values()
        .filter_map(|call| match (call.id, call.name) {
            (Some(id), Some(name)) => Some(ToolInvocation {
                id,
                name,
                arguments: serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({})),
            }),
            _ => None,
        })
        .collect();

    Ok(build_reply(text, tool_calls, stop_reason))
}

// OpenAI API response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

// OpenAI streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Deserialize)]
struct StreamToolCall {
    index: u64,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_use_becomes_native_tool_calls() {
        let canonical = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "t1", "name": "fetch", "input": {"symbol": "V"}}
            ]
        });

        let converted = convert_canonical_message(&canonical);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["role"], "assistant");
        assert_eq!(converted[0]["content"], "checking");
        let call = &converted[0]["tool_calls"][0];
        assert_eq!(call["id"], "t1");
        assert_eq!(call["function"]["name"], "fetch");
        assert_eq!(call["function"]["arguments"], "{\"symbol\":\"V\"}");
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let canonical = json!({
            "role": "user",
            "content": [
                {"type": "tool_result", "tool_use_id": "t1", "name": "fetch",
                 "content": [{"type": "text", "text": "42"}]},
                {"type": "tool_result", "tool_use_id": "t2", "name": "search",
                 "content": [{"type": "text", "text": "found"}]}
            ]
        });

        let converted = convert_canonical_message(&canonical);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0]["role"], "tool");
        assert_eq!(converted[0]["tool_call_id"], "t1");
        assert_eq!(converted[0]["content"], "42");
        assert_eq!(converted[1]["tool_call_id"], "t2");
    }

    #[test]
    fn plain_string_messages_pass_through() {
        let canonical = json!({"role": "user", "content": "hello"});
        assert_eq!(convert_canonical_message(&canonical), vec![canonical]);
    }

    #[test]
    fn reply_blocks_mirror_text_and_calls() {
        let reply = build_reply(
            "on it".to_string(),
            vec![ToolInvocation {
                id: "c1".to_string(),
                name: "fetch".to_string(),
                arguments: json!({"symbol": "V"}),
            }],
            "tool_calls".to_string(),
        );

        assert_eq!(reply.assistant_blocks.len(), 2);
        assert_eq!(reply.assistant_blocks[0]["type"], "text");
        assert_eq!(reply.assistant_blocks[1]["type"], "tool_use");
        assert_eq!(reply.assistant_blocks[1]["input"], json!({"symbol": "V"}));
    }

    #[test]
    fn non_object_schemas_are_normalized() {
        assert_eq!(
            normalize_schema(&json!("not a schema")),
            json!({"type": "object", "properties": {}})
        );
        let object = json!({"type": "object", "properties": {"q": {"type": "string"}}});
        assert_eq!(normalize_schema(&object), object);
    }

    #[test]
    fn malformed_arguments_default_to_null_then_empty() {
        let call = ApiToolCall {
            id: "c1".to_string(),
            function: ApiFunction {
                name: "fetch".to_string(),
                arguments: "{broken".to_string(),
            },
        };
        let invocation = invocation_from_call(&call);
        assert_eq!(invocation.arguments, Value::Null);
    }
}
