//! Anthropic SSE stream consumption: text deltas are flushed to stdout as
//! they arrive, content blocks are reassembled in arrival order so the tool
//! loop sees the same shape as the buffered path.

use std::io::Write;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::provider::ProviderError;
use crate::sse::{parse_sse_line, LineBuffer, SseLine};

pub(crate) struct StreamedMessage {
    pub blocks: Vec<Value>,
    pub stop_reason: String,
}

pub(crate) async fn collect_stream(
    resp: reqwest::Response,
) -> Result<StreamedMessage, ProviderError> {
    let mut state = StreamState::default();
    let mut lines = LineBuffer::default();
    let mut current_event = String::new();

    let mut byte_stream = resp.bytes_stream();
    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProviderError::Http)?;
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        for line in lines.push(text) {
            match parse_sse_line(&line) {
                Some(SseLine::Event(event)) => current_event = event,
                Some(SseLine::Data(data)) => state.handle(&current_event, &data)?,
                None => {}
            }
        }
    }

    Ok(StreamedMessage {
        blocks: state.blocks,
        stop_reason: state.stop_reason,
    })
}

#[derive(Default)]
struct StreamState {
    blocks: Vec<Value>,
    stop_reason: String,
    block_type: String,
    text_acc: String,
    tool_use_id: String,
    tool_use_name: String,
    tool_input_json: String,
}

impl StreamState {
    fn handle(&mut self, event: &str, data: &str) -> Result<(), ProviderError> {
        match event {
            "content_block_start" => {
                if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                    self.block_type = start.content_block.block_type.clone();
                    if self.block_type == "tool_use" {
                        self.tool_use_id = start.content_block.id.unwrap_or_default();
                        self.tool_use_name = start.content_block.name.unwrap_or_default();
                        self.tool_input_json.clear();
                    } else {
                        self.text_acc.clear();
                    }
                }
            }

            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                    match delta.delta.delta_type.as_str() {
                        "text_delta" => {
                            if let Some(text) = delta.delta.text {
                                print!("{text}");
                                let _ = std::io::stdout().flush();
                                self.text_acc.push_str(&text);
                            }
                        }
                        "input_json_delta" => {
                            if let Some(partial) = delta.delta.partial_json {
                                self.tool_input_json.push_str(&partial);
                            }
                        }
                        other => debug!(delta_type = other, "unhandled delta type"),
                    }
                }
            }

            "content_block_stop" => {
                match self.block_type.as_str() {
                    "tool_use" => {
                        let input =
                            serde_json::from_str::<Value>(&self.tool_input_json)
                                .unwrap_or_else(|_| json!({}));
                        self.blocks.push(json!({
                            "type": "tool_use",
                            "id": std::mem::take(&mut self.tool_use_id),
                            "name": std::mem::take(&mut self.tool_use_name),
                            "input": input,
                        }));
                        self.tool_input_json.clear();
                    }
                    "text" => {
                        let text = std::mem::take(&mut self.text_acc);
                        if !text.is_empty() {
                            self.blocks.push(json!({"type": "text", "text": text}));
                        }
                    }
                    _ => {}
                }
                self.block_type.clear();
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
            }

            "error" => {
                warn!(data, "anthropic stream error");
                return Err(ProviderError::Parse(format!("stream error: {data}")));
            }

            // message_start, message_stop, ping — nothing to do
            _ => {}
        }
        Ok(())
    }
}

// Anthropic SSE data types (private — deserialization only)

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut StreamState, event: &str, data: &str) {
        state.handle(event, data).unwrap();
    }

    #[test]
    fn text_and_tool_blocks_reassemble_in_order() {
        let mut state = StreamState::default();

        feed(
            &mut state,
            "content_block_start",
            r#"{"content_block": {"type": "text"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "text_delta", "text": "let me "}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "text_delta", "text": "check"}}"#,
        );
        feed(&mut state, "content_block_stop", "{}");

        feed(
            &mut state,
            "content_block_start",
            r#"{"content_block": {"type": "tool_use", "id": "t1", "name": "fetch"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "input_json_delta", "partial_json": "{\"sym"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "input_json_delta", "partial_json": "bol\": \"V\"}"}}"#,
        );
        feed(&mut state, "content_block_stop", "{}");
        feed(
            &mut state,
            "message_delta",
            r#"{"delta": {"stop_reason": "tool_use"}}"#,
        );

        assert_eq!(state.blocks.len(), 2);
        assert_eq!(state.blocks[0], json!({"type": "text", "text": "let me check"}));
        assert_eq!(
            state.blocks[1],
            json!({"type": "tool_use", "id": "t1", "name": "fetch", "input": {"symbol": "V"}})
        );
        assert_eq!(state.stop_reason, "tool_use");
    }

    #[test]
    fn malformed_tool_input_defaults_to_empty_object() {
        let mut state = StreamState::default();
        feed(
            &mut state,
            "content_block_start",
            r#"{"content_block": {"type": "tool_use", "id": "t1", "name": "fetch"}}"#,
        );
        feed(
            &mut state,
            "content_block_delta",
            r#"{"delta": {"type": "input_json_delta", "partial_json": "{broken"}}"#,
        );
        feed(&mut state, "content_block_stop", "{}");

        assert_eq!(state.blocks[0]["input"], json!({}));
    }

    #[test]
    fn stream_error_event_is_fatal() {
        let mut state = StreamState::default();
        assert!(state.handle("error", r#"{"message": "overloaded"}"#).is_err());
    }
}
