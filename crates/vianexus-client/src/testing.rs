//! Shared mocks for the loop and client tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use vianexus_mcp::{ChannelError, ToolCallOutcome, ToolDescriptor, ToolDispatcher};

use crate::provider::{ModelBackend, ProviderError, ToolInvocation, TurnReply, TurnRequest};

/// Backend that replays a fixed script of replies and records every request.
pub(crate) struct ScriptedBackend {
    replies: Mutex<Vec<TurnReply>>,
    pub requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedBackend {
    pub fn new(mut replies: Vec<TurnReply>) -> Self {
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, request: &TurnRequest) -> Result<TurnReply, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| ProviderError::Unavailable("script exhausted".to_string()))
    }
}

pub(crate) fn text_reply(text: &str) -> TurnReply {
    TurnReply {
        text: text.to_string(),
        tool_calls: Vec::new(),
        assistant_blocks: vec![json!({"type": "text", "text": text})],
        stop_reason: "end_turn".to_string(),
    }
}

pub(crate) fn tool_reply(id: &str, name: &str, arguments: Value) -> TurnReply {
    TurnReply {
        text: String::new(),
        tool_calls: vec![ToolInvocation {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.clone(),
        }],
        assistant_blocks: vec![json!({
            "type": "tool_use", "id": id, "name": name, "input": arguments,
        })],
        stop_reason: "tool_use".to_string(),
    }
}

/// Dispatcher returning a fixed payload for every call.
pub(crate) struct FixedDispatcher {
    pub payload: Value,
    pub is_error: bool,
    pub healthy: std::sync::atomic::AtomicBool,
    pub calls: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FixedDispatcher {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            is_error: false,
            healthy: std::sync::atomic::AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ToolDispatcher for FixedDispatcher {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ChannelError> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("unhealthy".to_string()));
        }
        Ok(vec![ToolDescriptor {
            name: "fetch".to_string(),
            description: "fetch data".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }])
    }

    async fn call_tool(
        &self,
        _name: &str,
        _arguments: Value,
    ) -> Result<ToolCallOutcome, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolCallOutcome {
            content: self.payload.clone(),
            is_error: self.is_error,
        })
    }

    fn session_id(&self) -> Option<&str> {
        Some("mcp_test")
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
