use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::auth::AccessTokenProvider;
use crate::error::{ChannelError, Result};

const PROTOCOL_VERSION: &str = "2025-06-18";

/// Normalized tool entry from the server's catalogue.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Raw result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub content: Value,
    pub is_error: bool,
}

/// The tool-server operations the orchestrator depends on.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutcome>;

    /// Transport session id, when the server assigned one.
    fn session_id(&self) -> Option<&str>;

    /// Probe: list tools and assert success.
    async fn health_check(&self) -> bool {
        self.list_tools().await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Close that absorbs teardown races. The cleanup frequently runs on a
    /// task other than the one that opened the transport; cancellation errors
    /// from that boundary are expected and logged at debug.
    async fn close_tolerant(&self) {
        match self.close().await {
            Ok(()) => {}
            Err(ChannelError::Cancelled(reason)) => {
                debug!(reason = %reason, "transport cleanup skipped at task boundary");
            }
            Err(e) => warn!(error = %e, "error closing tool channel"),
        }
    }
}

/// One live streamable-HTTP session to the MCP server.
///
/// JSON-RPC 2.0 over POST; the server may answer a request either as a plain
/// JSON document or as an SSE stream carrying the response. Every request
/// carries the `X-Tool-Categories` filter header and OAuth bearer auth.
pub struct ToolChannel {
    http: reqwest::Client,
    endpoint: String,
    categories: String,
    auth: Arc<dyn AccessTokenProvider>,
    session_id: Option<String>,
    next_id: AtomicI64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ToolChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolChannel")
            .field("endpoint", &self.endpoint)
            .field("categories", &self.categories)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ToolChannel {
    pub(crate) fn new(
        endpoint: String,
        categories: String,
        auth: Arc<dyn AccessTokenProvider>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            categories,
            auth,
            session_id: None,
            next_id: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let token = self.auth.bearer_token().await?;
        let mut request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
            .header("X-Tool-Categories", &self.categories);
        if let Some(session_id) = &self.session_id {
            request = request.header("Mcp-Session-Id", session_id);
        }
        Ok(request.json(body).send().await?)
    }

    /// Issue a request and return the JSON-RPC `result` member.
    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }

        let id = self.next_request_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "tool server request");
        let resp = self.post(&body).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "tool server HTTP error");
            return Err(ChannelError::Transport(format!(
                "HTTP {status}: {text}"
            )));
        }

        read_rpc_result(resp, id).await
    }

    /// Fire a JSON-RPC notification (no id, no response body expected).
    async fn notify(&self, method: &str) -> Result<()> {
        let body = json!({"jsonrpc": "2.0", "method": method});
        let resp = self.post(&body).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "notification rejected (HTTP {status}): {text}"
            )));
        }
        Ok(())
    }

    /// Perform the MCP initialize handshake and capture the transport
    /// session id from the `Mcp-Session-Id` response header.
    pub(crate) async fn connect(&mut self) -> Result<()> {
        let id = self.next_request_id();
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "vianexus-agent-sdk",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
        });

        let resp = self.post(&body).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Transport(format!(
                "initialize failed (HTTP {status}): {text}"
            )));
        }

        let session_id = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let result = read_rpc_result(resp, id).await?;
        let server = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(server, session_id = session_id.as_deref(), "MCP session initialized");

        self.session_id = session_id;
        self.notify("notifications/initialized").await?;
        Ok(())
    }
}

#[async_trait]
impl ToolDispatcher for ToolChannel {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result = self.rpc("tools/list", json!({})).await?;

        let mut tools = Vec::new();
        for entry in result
            .get("tools")
            .and_then(Value::as_array)
            .unwrap_or(&Vec::new())
        {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                warn!("skipping tool entry without a name");
                continue;
            };
            tools.push(ToolDescriptor {
                name: name.to_string(),
                description: entry
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                input_schema: entry
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            });
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallOutcome> {
        info!(tool = name, "calling tool");
        let result = self
            .rpc(
                "tools/call",
                json!({"name": name, "arguments": arguments}),
            )
            .await?;

        Ok(ToolCallOutcome {
            content: result.get("content").cloned().unwrap_or(Value::Null),
            is_error: result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(()); // already closed
        }

        let token = self.auth.bearer_token().await?;
        let mut request = self
            .http
            .delete(&self.endpoint)
            .bearer_auth(token)
            .header("X-Tool-Categories", &self.categories);
        if let Some(session_id) = &self.session_id {
            request = request.header("Mcp-Session-Id", session_id);
        }

        match request.send().await {
            Ok(_) => {
                debug!("tool channel closed");
                Ok(())
            }
            // teardown often races the transport's owning task going away;
            // surface that as the cancellation kind so tolerant close can
            // absorb it
            Err(e) if e.is_connect() || e.is_request() => {
                Err(ChannelError::Cancelled(e.to_string()))
            }
            Err(e) => Err(ChannelError::Transport(e.to_string())),
        }
    }
}

fn unwrap_rpc(body: Value) -> Result<Value> {
    if let Some(error) = body.get("error") {
        return Err(ChannelError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| ChannelError::Parse("response has no result member".to_string()))
}

/// Extract the JSON-RPC response for `id`, whether the server answered with
/// plain JSON or an SSE stream.
async fn read_rpc_result(resp: reqwest::Response, id: i64) -> Result<Value> {
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !content_type.starts_with("text/event-stream") {
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::Parse(e.to_string()))?;
        return unwrap_rpc(body);
    }

    // SSE: buffer lines, take the first data payload carrying our response id
    let mut line_buf = String::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ChannelError::Transport(e.to_string()))?;
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        line_buf.push_str(text);

        while let Some(newline) = line_buf.find('\n') {
            let line: String = line_buf.drain(..=newline).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            if let Ok(value) = serde_json::from_str::<Value>(data.trim_start()) {
                if value.get("id").and_then(Value::as_i64) == Some(id) {
                    return unwrap_rpc(value);
                }
            }
        }
    }

    Err(ChannelError::Parse(
        "stream ended before a response arrived".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuth;

    fn channel() -> ToolChannel {
        ToolChannel::new(
            "https://example.com:8443/mcp".to_string(),
            "financial".to_string(),
            Arc::new(StaticTokenAuth("tok".to_string())),
        )
    }

    #[test]
    fn request_ids_are_monotonic() {
        let channel = channel();
        let first = channel.next_request_id();
        let second = channel.next_request_id();
        assert!(second > first);
    }

    #[test]
    fn rpc_error_member_maps_to_typed_error() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "Method not found"}});
        let err = unwrap_rpc(body).unwrap_err();
        match err {
            ChannelError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rpc_result_member_is_unwrapped() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        assert_eq!(unwrap_rpc(body).unwrap(), json!({"tools": []}));
    }

    #[tokio::test]
    async fn requests_after_close_are_rejected() {
        let channel = channel();
        channel.closed.store(true, Ordering::SeqCst);
        let err = channel.rpc("tools/list", json!({})).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let channel = channel();
        channel.closed.store(true, Ordering::SeqCst);
        assert!(channel.close().await.is_ok());
    }
}
