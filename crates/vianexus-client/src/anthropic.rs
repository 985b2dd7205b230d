use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::{ModelBackend, ProviderError, ToolInvocation, TurnReply, TurnRequest};
use crate::recover::recover_tool_use_blocks;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn send(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        let body = build_request_body(request, false);
        debug!(model = %request.model, "sending request to Anthropic");

        let resp = self.request(&body).send().await?;
        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(reply_from_blocks(
            api_resp.content,
            api_resp.stop_reason.unwrap_or_default(),
        ))
    }

    async fn send_stream(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        let body = build_request_body(request, true);
        debug!(model = %request.model, "sending streaming request to Anthropic");

        let resp = self.request(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic streaming API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let streamed = crate::anthropic_stream::collect_stream(resp).await?;
        Ok(reply_from_blocks(streamed.blocks, streamed.stop_reason))
    }
}

fn build_request_body(request: &TurnRequest, stream: bool) -> Value {
    // the canonical buffer is already Anthropic-shaped; only the cross-
    // provider extras on tool_result blocks need stripping
    let messages: Vec<Value> = request.messages.iter().map(sanitize_message).collect();

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "system": request.system,
        "messages": messages,
        "stream": stream,
    });

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }

    body
}

/// Drop the `name` key the orchestrator records on tool_result blocks for
/// Gemini's benefit; the Anthropic API does not accept it.
fn sanitize_message(message: &Value) -> Value {
    let Some(blocks) = message.get("content").and_then(Value::as_array) else {
        return message.clone();
    };

    let cleaned: Vec<Value> = blocks
        .iter()
        .map(|block| {
            if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                let mut block = block.clone();
                if let Some(map) = block.as_object_mut() {
                    map.remove("name");
                }
                block
            } else {
                block.clone()
            }
        })
        .collect();

    let mut message = message.clone();
    message["content"] = Value::Array(cleaned);
    message
}

/// Classify raw content blocks into a [`TurnReply`], recovering stringified
/// tool-use blocks first.
fn reply_from_blocks(mut blocks: Vec<Value>, stop_reason: String) -> TurnReply {
    recover_tool_use_blocks(&mut blocks);

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in &blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolInvocation {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or("call_0")
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }

    TurnReply {
        text,
        tool_calls,
        assistant_blocks: blocks,
        stop_reason,
    }
}

// Anthropic API response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    /// Raw block values; kept as JSON so unknown block kinds survive the
    /// round trip back into the buffer.
    content: Vec<Value>,
    stop_reason: Option<String>,
}
