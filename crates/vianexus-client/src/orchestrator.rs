//! The per-turn orchestration loop, uniform across providers:
//!
//! ```text
//! READY → SEND → AWAIT_REPLY → (TEXT | TOOLS)
//! TEXT  → PERSIST → DONE
//! TOOLS → DISPATCH → INJECT_RESULTS → SEND
//! ```
//!
//! The loop operates on the canonical block buffer; backends translate to
//! their native wire shapes on every SEND. Tool failures never abort a turn —
//! they are injected as `Error`-prefixed results and the loop continues.

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use vianexus_mcp::{ToolDescriptor, ToolDispatcher};
use vianexus_memory::{ConversationMemory, MessageRole, MessageType};

use crate::error::ClientError;
use crate::provider::{ModelBackend, ToolInvocation, ToolOutcome, TurnRequest};

/// Uniform ceiling on a single tool-result payload.
pub const MAX_TOOL_RESULT_BYTES: usize = 1_000_000;

/// Backstop against runaway tool loops.
const MAX_TURNS: usize = 25;

/// Provider settings fixed for the duration of one ask.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub model: String,
    pub system: String,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Run the loop until the model answers with text only. The pending user
/// utterance must already be in `messages`; the accumulated text across all
/// iterations is returned (trimmed).
pub async fn run_turn(
    backend: &dyn ModelBackend,
    dispatcher: Option<&dyn ToolDispatcher>,
    catalogue: &[ToolDescriptor],
    messages: &mut Vec<Value>,
    settings: &TurnSettings,
    mut memory: Option<&mut ConversationMemory>,
) -> Result<String, ClientError> {
    let mut answer = String::new();

    for iteration in 0..MAX_TURNS {
        let request = TurnRequest {
            model: settings.model.clone(),
            system: settings.system.clone(),
            messages: messages.clone(),
            tools: catalogue.to_vec(),
            max_tokens: settings.max_tokens,
        };

        debug!(iteration, tools = catalogue.len(), "tool loop iteration");
        let reply = if settings.stream {
            backend.send_stream(&request).await?
        } else {
            backend.send(&request).await?
        };

        answer.push_str(&reply.text);
        messages.push(json!({
            "role": "assistant",
            "content": reply.assistant_blocks,
        }));

        if let Some(memory) = memory.as_deref_mut() {
            let message_type = if reply.tool_calls.is_empty() {
                None
            } else {
                Some(MessageType::ToolCall)
            };
            memory
                .save(
                    MessageRole::Assistant,
                    Value::Array(reply.assistant_blocks.clone()),
                    message_type,
                    None,
                )
                .await;
        }

        if reply.tool_calls.is_empty() {
            info!(iteration, "tool loop complete — no more tool calls");
            if settings.stream {
                println!();
            }
            return Ok(answer.trim().to_string());
        }

        let outcomes = dispatch_tool_calls(dispatcher, &reply.tool_calls).await;
        let result_blocks: Vec<Value> = outcomes.iter().map(tool_result_block).collect();
        messages.push(json!({"role": "user", "content": result_blocks}));

        if let Some(memory) = memory.as_deref_mut() {
            memory
                .save(
                    MessageRole::User,
                    Value::Array(result_blocks),
                    Some(MessageType::ToolResult),
                    None,
                )
                .await;
        }
    }

    warn!(max_turns = MAX_TURNS, "tool loop hit maximum iterations");
    if settings.stream {
        println!();
    }
    Ok(answer.trim().to_string())
}

/// Dispatch serially through the channel. Failures synthesize an outcome
/// whose text begins `Error`; the loop never raises for a tool.
async fn dispatch_tool_calls(
    dispatcher: Option<&dyn ToolDispatcher>,
    calls: &[ToolInvocation],
) -> Vec<ToolOutcome> {
    let mut outcomes = Vec::with_capacity(calls.len());
    for call in calls {
        let outcome = match dispatcher {
            None => ToolOutcome::error(
                call,
                format!("Error: no tool channel available for '{}'", call.name),
            ),
            Some(dispatcher) => {
                info!(tool = %call.name, "calling tool");
                match dispatcher.call_tool(&call.name, call.arguments.clone()).await {
                    Ok(result) => {
                        let (text, truncated_bytes) =
                            truncate_text(reduce_payload(&result.content), MAX_TOOL_RESULT_BYTES);
                        if truncated_bytes > 0 {
                            warn!(tool = %call.name, truncated_bytes, "tool result truncated");
                        }
                        if result.is_error {
                            let text = if text.starts_with("Error") {
                                text
                            } else {
                                format!("Error: {text}")
                            };
                            ToolOutcome {
                                invocation_id: call.id.clone(),
                                name: call.name.clone(),
                                text,
                                is_error: true,
                                truncated_bytes,
                            }
                        } else {
                            ToolOutcome {
                                invocation_id: call.id.clone(),
                                name: call.name.clone(),
                                text,
                                is_error: false,
                                truncated_bytes,
                            }
                        }
                    }
                    Err(e) => {
                        error!(tool = %call.name, error = %e, "tool call failed");
                        ToolOutcome::error(
                            call,
                            format!("Error calling tool '{}': {e}", call.name),
                        )
                    }
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

/// Reduce a tool payload to a single string: prefer `.text` on the first
/// element, else stringify the first element, else stringify the whole
/// payload.
pub(crate) fn reduce_payload(content: &Value) -> String {
    match content {
        Value::Array(items) => match items.first() {
            None => "No content returned".to_string(),
            Some(first) => match first.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => value_to_text(first),
            },
        },
        Value::Object(map) => map
            .get("text")
            .or_else(|| map.get("content"))
            .map(value_to_text)
            .unwrap_or_else(|| content.to_string()),
        Value::Null => "No content returned".to_string(),
        other => value_to_text(other),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truncate at a char boundary; returns the kept text and how many bytes
/// were dropped.
pub(crate) fn truncate_text(text: String, max_bytes: usize) -> (String, usize) {
    if text.len() <= max_bytes {
        return (text, 0);
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    let mut text = text;
    text.truncate(cut);
    (text, dropped)
}

/// Canonical tool_result block. The `name` rides along for Gemini's
/// function responses; the Anthropic builder strips it at the wire.
fn tool_result_block(outcome: &ToolOutcome) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": outcome.invocation_id,
        "name": outcome.name,
        "is_error": outcome.is_error,
        "content": [{"type": "text", "text": outcome.text}],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::Ordering;

    use vianexus_mcp::{ChannelError, ToolCallOutcome};

    use crate::testing::{text_reply, tool_reply, FixedDispatcher, ScriptedBackend};

    fn settings() -> TurnSettings {
        TurnSettings {
            model: "test-model".to_string(),
            system: "system".to_string(),
            max_tokens: 256,
            stream: false,
        }
    }

    fn catalogue() -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "fetch".to_string(),
            description: "fetch data".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }]
    }

    #[tokio::test]
    async fn loop_dispatches_then_terminates_on_text() {
        let backend = ScriptedBackend::new(vec![
            tool_reply("t1", "fetch", json!({"symbol": "V"})),
            text_reply("done"),
        ]);
        let dispatcher = FixedDispatcher::new(json!([{"text": "42"}]));
        let mut messages = vec![json!({"role": "user", "content": "quote V"})];

        let answer = run_turn(
            &backend,
            Some(&dispatcher),
            &catalogue(),
            &mut messages,
            &settings(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(answer, "done");
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        // buffer: user, assistant(tool_use), user(tool_result), assistant(text)
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        let result_block = &messages[2]["content"][0];
        assert_eq!(result_block["type"], "tool_result");
        assert_eq!(result_block["tool_use_id"], "t1");
        assert_eq!(result_block["content"][0]["text"], "42");
        assert_eq!(messages[3]["content"][0]["text"], "done");
    }

    #[tokio::test]
    async fn empty_catalogue_degenerates_to_one_round_trip() {
        let backend = ScriptedBackend::new(vec![text_reply("plain answer")]);
        let mut messages = vec![json!({"role": "user", "content": "hi"})];

        let answer = run_turn(&backend, None, &[], &mut messages, &settings(), None)
            .await
            .unwrap();

        assert_eq!(answer, "plain answer");
        assert_eq!(backend.requests.lock().unwrap().len(), 1);
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn catalogue_is_identical_on_every_send() {
        let backend = ScriptedBackend::new(vec![
            tool_reply("t1", "fetch", json!({})),
            text_reply("ok"),
        ]);
        let dispatcher = FixedDispatcher::new(json!([{"text": "x"}]));
        let catalogue = catalogue();
        let mut messages = vec![json!({"role": "user", "content": "q"})];

        run_turn(
            &backend,
            Some(&dispatcher),
            &catalogue,
            &mut messages,
            &settings(),
            None,
        )
        .await
        .unwrap();

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools, catalogue);
        assert_eq!(requests[1].tools, catalogue);
    }

    #[tokio::test]
    async fn failed_tool_injects_error_and_continues() {
        struct FailingDispatcher;

        #[async_trait]
        impl ToolDispatcher for FailingDispatcher {
            async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ChannelError> {
                Ok(Vec::new())
            }
            async fn call_tool(
                &self,
                _name: &str,
                _arguments: Value,
            ) -> Result<ToolCallOutcome, ChannelError> {
                Err(ChannelError::Transport("connection reset".to_string()))
            }
            fn session_id(&self) -> Option<&str> {
                None
            }
        }

        let backend = ScriptedBackend::new(vec![
            tool_reply("t1", "fetch", json!({})),
            text_reply("recovered"),
        ]);
        let mut messages = vec![json!({"role": "user", "content": "q"})];

        let answer = run_turn(
            &backend,
            Some(&FailingDispatcher),
            &catalogue(),
            &mut messages,
            &settings(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(answer, "recovered");
        let text = messages[2]["content"][0]["content"][0]["text"]
            .as_str()
            .unwrap();
        assert!(text.starts_with("Error calling tool 'fetch'"));
        assert_eq!(messages[2]["content"][0]["is_error"], true);
    }

    #[tokio::test]
    async fn error_flagged_payloads_become_error_results() {
        let backend = ScriptedBackend::new(vec![
            tool_reply("t1", "fetch", json!({})),
            text_reply("noted"),
        ]);
        let mut dispatcher = FixedDispatcher::new(json!([{"text": "not found"}]));
        dispatcher.is_error = true;
        let mut messages = vec![json!({"role": "user", "content": "q"})];

        run_turn(
            &backend,
            Some(&dispatcher),
            &catalogue(),
            &mut messages,
            &settings(),
            None,
        )
        .await
        .unwrap();

        let text = messages[2]["content"][0]["content"][0]["text"]
            .as_str()
            .unwrap();
        assert_eq!(text, "Error: not found");
    }

    #[tokio::test]
    async fn missing_dispatcher_yields_error_results_not_a_crash() {
        let backend = ScriptedBackend::new(vec![
            tool_reply("t1", "fetch", json!({})),
            text_reply("fine"),
        ]);
        let mut messages = vec![json!({"role": "user", "content": "q"})];

        let answer = run_turn(&backend, None, &catalogue(), &mut messages, &settings(), None)
            .await
            .unwrap();

        assert_eq!(answer, "fine");
        let text = messages[2]["content"][0]["content"][0]["text"]
            .as_str()
            .unwrap();
        assert!(text.starts_with("Error: no tool channel"));
    }

    #[tokio::test]
    async fn model_errors_propagate_without_an_assistant_entry() {
        let backend = ScriptedBackend::new(vec![]);
        let mut messages = vec![json!({"role": "user", "content": "q"})];

        let result = run_turn(&backend, None, &[], &mut messages, &settings(), None).await;
        assert!(result.is_err());
        // the buffer still ends with the user utterance
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn payload_reduction_prefers_first_text() {
        assert_eq!(reduce_payload(&json!([{"text": "first"}, {"text": "second"}])), "first");
        assert_eq!(reduce_payload(&json!([{"data": 7}])), "{\"data\":7}");
        assert_eq!(reduce_payload(&json!([])), "No content returned");
        assert_eq!(reduce_payload(&json!({"text": "obj"})), "obj");
        assert_eq!(reduce_payload(&json!({"content": "inner"})), "inner");
        assert_eq!(reduce_payload(&json!("bare")), "bare");
        assert_eq!(reduce_payload(&json!(5)), "5");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let (kept, dropped) = truncate_text("abcdef".to_string(), 4);
        assert_eq!(kept, "abcd");
        assert_eq!(dropped, 2);

        // 'é' is two bytes; a cut through it backs up to the boundary
        let (kept, dropped) = truncate_text("aé".to_string(), 2);
        assert_eq!(kept, "a");
        assert_eq!(dropped, 2);

        let (kept, dropped) = truncate_text("short".to_string(), 100);
        assert_eq!(kept, "short");
        assert_eq!(dropped, 0);
    }
}
