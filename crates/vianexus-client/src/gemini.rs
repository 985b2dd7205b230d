use std::io::Write;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::openai::tool_result_text;
use crate::provider::{ModelBackend, ProviderError, ToolInvocation, TurnReply, TurnRequest};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiBackend {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn send(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        let body = build_request_body(request);
        debug!(model = %request.model, "sending request to Gemini");

        let resp = self
            .client
            .post(self.endpoint(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_ms: 5000,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Gemini API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api_resp))
    }

    /// Gemini is consumed buffered; the stream variant emits the finished
    /// text in one flush so callers observe the same stdout contract.
    async fn send_stream(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        let reply = self.send(request).await?;
        if !reply.text.is_empty() {
            print!("{}", reply.text);
            let _ = std::io::stdout().flush();
        }
        Ok(reply)
    }
}

fn build_request_body(request: &TurnRequest) -> Value {
    let contents: Vec<Value> = request.messages.iter().map(canonical_to_content).collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
        },
    });

    if !request.system.is_empty() {
        body["systemInstruction"] = json!({"parts": [{"text": request.system}]});
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize_schema(&t.input_schema),
                })
            })
            .collect();
        body["tools"] = json!([{"functionDeclarations": declarations}]);
    }

    body
}

/// Translate one canonical message into a Gemini `Content`: assistant maps
/// to the `model` role, `tool_use` blocks to `functionCall` parts, and
/// `tool_result` blocks to `functionResponse` parts carrying
/// `{"result": text}` or `{"error": text}`.
fn canonical_to_content(message: &Value) -> Value {
    let role = match message.get("role").and_then(Value::as_str) {
        Some("assistant") => "model",
        _ => "user",
    };

    let parts: Vec<Value> = match message.get("content") {
        Some(Value::String(text)) => vec![json!({"text": text})],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| json!({"text": t})),
                Some("tool_use") => Some(json!({
                    "functionCall": {
                        "name": block.get("name").and_then(Value::as_str).unwrap_or("unknown"),
                        "args": block.get("input").cloned().unwrap_or_else(|| json!({})),
                    }
                })),
                Some("tool_result") => {
                    let text = tool_result_text(block);
                    let is_error = block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let response = if is_error {
                        json!({"error": text})
                    } else {
                        json!({"result": text})
                    };
                    Some(json!({
                        "functionResponse": {
                            "name": block.get("name").and_then(Value::as_str).unwrap_or("unknown"),
                            "response": response,
                        }
                    }))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    json!({"role": role, "parts": parts})
}

/// Keep only the schema fields Gemini's function declarations accept,
/// recursing into `properties` and `items`. Non-object inputs collapse to
/// the empty object schema.
pub fn sanitize_schema(schema: &Value) -> Value {
    const SUPPORTED: [&str; 6] = ["type", "description", "required", "properties", "items", "enum"];

    let Some(map) = schema.as_object() else {
        return json!({"type": "object", "properties": {}});
    };

    let mut out = Map::new();
    for (key, value) in map {
        if !SUPPORTED.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "properties" => {
                let mut properties = Map::new();
                if let Some(props) = value.as_object() {
                    for (name, prop_schema) in props {
                        properties.insert(name.clone(), sanitize_schema(prop_schema));
                    }
                }
                out.insert(key.clone(), Value::Object(properties));
            }
            "items" => {
                out.insert(key.clone(), sanitize_schema(value));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    if !out.contains_key("type") {
        out.insert("type".to_string(), json!("object"));
    }
    if out.get("type").and_then(Value::as_str) == Some("object") && !out.contains_key("properties")
    {
        out.insert("properties".to_string(), json!({}));
    }
    Value::Object(out)
}

fn parse_response(resp: GenerateResponse) -> TurnReply {
    let candidate = resp.candidates.into_iter().next();
    let parts = candidate
        .as_ref()
        .map(|c| c.content.parts.clone())
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut blocks = Vec::new();

    for (index, part) in parts.iter().enumerate() {
        if let Some(part_text) = part.get("text").and_then(Value::as_str) {
            text.push_str(part_text);
            blocks.push(json!({"type": "text", "text": part_text}));
        } else if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let arguments = call.get("args").cloned().unwrap_or_else(|| json!({}));
            // Gemini assigns no call ids; synthesize stable per-turn ids
            let id = format!("fn_{index}");
            blocks.push(json!({
                "type": "tool_use",
                "id": id.clone(),
                "name": name.clone(),
                "input": arguments.clone(),
            }));
            tool_calls.push(ToolInvocation {
                id,
                name,
                arguments,
            });
        }
    }

    TurnReply {
        text,
        tool_calls,
        assistant_blocks: blocks,
        stop_reason: candidate.and_then(|c| c.finish_reason).unwrap_or_default(),
    }
}

// Gemini API response types (private — deserialization only)

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: CandidateContent,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_tool_turns_map_to_parts() {
        let assistant = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "fetching"},
                {"type": "tool_use", "id": "t1", "name": "fetch", "input": {"symbol": "V"}}
            ]
        });
        let content = canonical_to_content(&assistant);
        assert_eq!(content["role"], "model");
        assert_eq!(content["parts"][0]["text"], "fetching");
        assert_eq!(content["parts"][1]["functionCall"]["name"], "fetch");
        assert_eq!(content["parts"][1]["functionCall"]["args"]["symbol"], "V");
    }

    #[test]
    fn tool_results_become_function_responses() {
        let results = json!({
            "role": "user",
            "content": [
                {"type": "tool_result", "tool_use_id": "t1", "name": "fetch",
                 "is_error": false, "content": [{"type": "text", "text": "42"}]},
                {"type": "tool_result", "tool_use_id": "t2", "name": "search",
                 "is_error": true, "content": [{"type": "text", "text": "Error: boom"}]}
            ]
        });

        let content = canonical_to_content(&results);
        assert_eq!(content["role"], "user");
        let ok = &content["parts"][0]["functionResponse"];
        assert_eq!(ok["name"], "fetch");
        assert_eq!(ok["response"]["result"], "42");
        let err = &content["parts"][1]["functionResponse"];
        assert_eq!(err["response"]["error"], "Error: boom");
    }

    #[test]
    fn schema_sanitizer_keeps_the_supported_subset() {
        let schema = json!({
            "type": "object",
            "title": "dropped",
            "additionalProperties": false,
            "description": "query params",
            "required": ["query"],
            "properties": {
                "query": {"type": "string", "default": "", "minLength": 1},
                "filters": {
                    "type": "array",
                    "items": {"type": "string", "format": "dropped", "enum": ["a", "b"]}
                }
            }
        });

        let sanitized = sanitize_schema(&schema);
        assert!(sanitized.get("title").is_none());
        assert!(sanitized.get("additionalProperties").is_none());
        assert_eq!(sanitized["description"], "query params");
        assert_eq!(sanitized["required"], json!(["query"]));
        assert!(sanitized["properties"]["query"].get("default").is_none());
        assert!(sanitized["properties"]["query"].get("minLength").is_none());
        let items = &sanitized["properties"]["filters"]["items"];
        assert!(items.get("format").is_none());
        assert_eq!(items["enum"], json!(["a", "b"]));
    }

    #[test]
    fn schema_sanitizer_applies_object_defaults() {
        assert_eq!(
            sanitize_schema(&json!(null)),
            json!({"type": "object", "properties": {}})
        );
        assert_eq!(
            sanitize_schema(&json!({"description": "untyped"})),
            json!({"type": "object", "properties": {}, "description": "untyped"})
        );
    }

    #[test]
    fn response_parts_classify_into_text_and_calls() {
        let resp = GenerateResponse {
            candidates: vec![Candidate {
                content: CandidateContent {
                    parts: vec![
                        json!({"text": "partial "}),
                        json!({"functionCall": {"name": "fetch", "args": {"symbol": "V"}}}),
                    ],
                },
                finish_reason: Some("STOP".to_string()),
            }],
        };

        let reply = parse_response(resp);
        assert_eq!(reply.text, "partial ");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "fetch");
        assert_eq!(reply.tool_calls[0].id, "fn_1");
        assert_eq!(reply.assistant_blocks[1]["type"], "tool_use");
        assert_eq!(reply.stop_reason, "STOP");
    }

    #[test]
    fn empty_candidates_degenerate_to_empty_reply() {
        let reply = parse_response(GenerateResponse { candidates: vec![] });
        assert!(reply.text.is_empty());
        assert!(reply.tool_calls.is_empty());
        assert!(reply.assistant_blocks.is_empty());
    }

    #[test]
    fn body_carries_system_instruction_and_declarations() {
        let request = TurnRequest {
            model: DEFAULT_MODEL.to_string(),
            system: "analyze".to_string(),
            messages: vec![json!({"role": "user", "content": "hi"})],
            tools: vec![vianexus_mcp::ToolDescriptor {
                name: "fetch".to_string(),
                description: "fetch data".to_string(),
                input_schema: json!({"type": "object", "properties": {}, "extra": 1}),
            }],
            max_tokens: 256,
        };

        let body = build_request_body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "analyze");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        let declaration = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "fetch");
        assert!(declaration["parameters"].get("extra").is_none());
    }
}
