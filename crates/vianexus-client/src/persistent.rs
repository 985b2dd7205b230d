use std::sync::Arc;

use tracing::{debug, error, info, warn};

use vianexus_mcp::{ChannelError, ToolDispatcher};

use crate::client::{AgentClient, AskOptions};
use crate::error::{ClientError, Result};

/// Options for [`PersistentClient::ask_with_persistent_session`].
#[derive(Debug, Clone, Copy)]
pub struct PersistentAskOptions {
    pub maintain_history: bool,
    pub use_memory: bool,
    /// Reconnect automatically when the health probe fails.
    pub auto_establish_connection: bool,
}

impl Default for PersistentAskOptions {
    fn default() -> Self {
        Self {
            maintain_history: true,
            use_memory: true,
            auto_establish_connection: true,
        }
    }
}

/// Long-lived client variant: keeps one transport session open across turns
/// and eagerly allocates a memory session id at construction so callers see
/// a non-null id immediately.
pub struct PersistentClient {
    inner: AgentClient,
    channel: Option<Arc<dyn ToolDispatcher>>,
    connection_active: bool,
    mcp_session_id: Option<String>,
}

impl PersistentClient {
    pub fn new(mut inner: AgentClient) -> Self {
        if let Some(memory) = inner.memory() {
            memory.preassign_session_id(Some("persistent"));
        }
        Self {
            inner,
            channel: None,
            connection_active: false,
            mcp_session_id: None,
        }
    }

    pub fn client(&mut self) -> &mut AgentClient {
        &mut self.inner
    }

    pub fn is_connected(&self) -> bool {
        self.connection_active && self.mcp_session_id.is_some()
    }

    pub fn mcp_session_id(&self) -> Option<&str> {
        self.mcp_session_id.as_deref()
    }

    pub fn memory_session_id(&self) -> Option<&str> {
        self.inner.memory_session_id()
    }

    /// Force memory-session creation and return its id.
    pub async fn initialize_memory_session(&mut self) -> Result<String> {
        let Some(memory) = self.inner.memory() else {
            return Err(ClientError::NotConnected(
                "memory is not enabled for this client".to_string(),
            ));
        };
        memory.initialize_session(None).await?;
        memory
            .session_id()
            .map(str::to_string)
            .ok_or_else(|| ClientError::NotConnected("failed to initialize memory session".to_string()))
    }

    /// Probe the live connection; an unhealthy probe downgrades the
    /// connection to inactive.
    async fn verify_connection_health(&mut self) -> bool {
        if !self.is_connected() {
            debug!("connection not active or no MCP session id");
            return false;
        }
        let Some(channel) = &self.channel else {
            debug!("no channel object available");
            return false;
        };

        if channel.health_check().await {
            debug!("connection health check passed");
            true
        } else {
            warn!("connection health check failed");
            self.connection_active = false;
            false
        }
    }

    /// Establish (or reuse) the persistent transport session and return its
    /// id. A healthy existing connection is reused; a stale one is torn down
    /// tolerantly first.
    pub async fn establish_persistent_connection(&mut self) -> Result<String> {
        if self.is_connected() {
            if self.verify_connection_health().await {
                let id = self.mcp_session_id.clone().unwrap_or_default();
                debug!(mcp_session_id = %id, "reusing healthy persistent connection");
                return Ok(id);
            }
            info!("existing connection unhealthy, re-establishing");
            self.close_persistent_connection().await;
        }

        match self.open_connection().await {
            Ok(id) => Ok(id),
            Err(e) => {
                error!(error = %e, "error establishing persistent MCP connection");
                self.close_persistent_connection().await;
                Err(e)
            }
        }
    }

    async fn open_connection(&mut self) -> Result<String> {
        self.inner.setup.create_auth_layer().await?;
        let channel = self.inner.setup.connect().await?;

        let mcp_session_id = channel
            .session_id()
            .map(str::to_string)
            .ok_or(ChannelError::MissingSessionId)?;

        let channel: Arc<dyn ToolDispatcher> = Arc::new(channel);
        self.inner.set_channel(channel.clone());
        if let Some(memory) = self.inner.memory() {
            memory.set_transport_session_id(&mcp_session_id);
        }

        self.channel = Some(channel);
        self.mcp_session_id = Some(mcp_session_id.clone());
        self.connection_active = true;
        info!(mcp_session_id = %mcp_session_id, "established persistent MCP connection");
        Ok(mcp_session_id)
    }

    /// Tear down the transport. Cross-task cancellation errors from the
    /// close are absorbed; the instance stays reusable either way.
    pub async fn close_persistent_connection(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close_tolerant().await;
        }
        self.connection_active = false;
        self.mcp_session_id = None;
        self.inner.clear_channel();
        info!("closed persistent MCP connection");
    }

    /// Health-check first, reconnect when allowed, then delegate to
    /// [`AgentClient::ask_question`] with memory wired through.
    pub async fn ask_with_persistent_session(
        &mut self,
        question: &str,
        opts: PersistentAskOptions,
    ) -> Result<String> {
        if opts.auto_establish_connection
            && (!self.is_connected() || !self.verify_connection_health().await)
        {
            self.establish_persistent_connection().await?;
        }

        if !self.is_connected() {
            return Err(ClientError::NotConnected(
                "no persistent MCP connection available; call establish_persistent_connection \
                 first or enable auto_establish_connection"
                    .to_string(),
            ));
        }

        self.inner
            .ask_question(
                question,
                AskOptions {
                    maintain_history: opts.maintain_history,
                    use_memory: opts.use_memory,
                    load_from_memory: opts.use_memory,
                },
            )
            .await
    }

    /// Set up authentication without opening the transport yet.
    pub async fn initialize(&mut self) -> Result<()> {
        self.inner.initialize().await
    }

    pub async fn cleanup(&mut self) {
        self.close_persistent_connection().await;
        self.inner.cleanup().await;
    }

    #[cfg(test)]
    pub(crate) fn attach_connection(&mut self, channel: Arc<dyn ToolDispatcher>, session_id: &str) {
        self.inner.set_channel(channel.clone());
        self.channel = Some(channel);
        self.mcp_session_id = Some(session_id.to_string());
        self.connection_active = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use vianexus_core::config::AgentConfig;
    use vianexus_memory::{ConversationMemory, InMemoryStore};

    use crate::factory::Provider;
    use crate::testing::{text_reply, tool_reply, FixedDispatcher, ScriptedBackend};

    fn test_config() -> AgentConfig {
        AgentConfig::from_json_value(json!({
            "LLM_API_KEY": "sk-ant-test",
            "agentServers": {
                "viaNexus": {
                    "server_url": "localhost",
                    "server_port": 8443,
                    "software_statement": "not.a.jwt"
                }
            }
        }))
        .unwrap()
    }

    fn persistent_with(replies: Vec<crate::provider::TurnReply>) -> PersistentClient {
        let memory = ConversationMemory::new(
            Arc::new(InMemoryStore::new()),
            None,
            Some("u1".to_string()),
            "anthropic",
        );
        let inner = AgentClient::with_backend(
            &test_config(),
            Provider::Anthropic,
            Box::new(ScriptedBackend::new(replies)),
            Some(memory),
        );
        PersistentClient::new(inner)
    }

    #[test]
    fn memory_session_id_is_eager() {
        let client = persistent_with(vec![]);
        let id = client.memory_session_id().unwrap();
        assert!(id.starts_with("anthropic_u1_persistent_"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn ask_uses_the_attached_connection() {
        let mut client = persistent_with(vec![
            tool_reply("t1", "fetch", json!({"symbol": "V"})),
            text_reply("done"),
        ]);
        let dispatcher = Arc::new(FixedDispatcher::new(json!([{"text": "42"}])));
        client.attach_connection(dispatcher.clone(), "mcp_1");

        let answer = client
            .ask_with_persistent_session("quote V", PersistentAskOptions::default())
            .await
            .unwrap();

        assert_eq!(answer, "done");
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.mcp_session_id(), Some("mcp_1"));
    }

    #[tokio::test]
    async fn failed_probe_downgrades_the_connection() {
        let mut client = persistent_with(vec![]);
        let dispatcher = Arc::new(FixedDispatcher::new(json!([])));
        client.attach_connection(dispatcher.clone(), "mcp_1");
        dispatcher.healthy.store(false, Ordering::SeqCst);

        assert!(!client.verify_connection_health().await);
        assert!(!client.connection_active);
    }

    #[tokio::test]
    async fn ask_without_connection_and_without_auto_establish_fails() {
        let mut client = persistent_with(vec![text_reply("never sent")]);
        let opts = PersistentAskOptions {
            auto_establish_connection: false,
            ..Default::default()
        };

        let err = client
            .ask_with_persistent_session("q", opts)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
    }

    #[tokio::test]
    async fn close_resets_state_and_stays_reusable() {
        let mut client = persistent_with(vec![text_reply("after close")]);
        let dispatcher = Arc::new(FixedDispatcher::new(json!([])));
        client.attach_connection(dispatcher.clone(), "mcp_1");

        client.close_persistent_connection().await;
        assert!(!client.is_connected());
        assert!(client.mcp_session_id().is_none());
        assert_eq!(dispatcher.closes.load(Ordering::SeqCst), 1);

        // a fresh connection can be attached and used again
        let fresh = Arc::new(FixedDispatcher::new(json!([])));
        client.attach_connection(fresh, "mcp_2");
        let answer = client
            .ask_with_persistent_session("q", PersistentAskOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, "after close");
    }

    #[tokio::test]
    async fn memory_correlates_with_the_transport_session() {
        let mut client = persistent_with(vec![text_reply("ok")]);
        let dispatcher = Arc::new(FixedDispatcher::new(json!([])));
        client.attach_connection(dispatcher, "mcp_42");
        // attach_connection skips the facade hook; set it the way
        // open_connection does
        client.client().memory().unwrap().set_transport_session_id("mcp_42");

        client
            .ask_with_persistent_session("hello", PersistentAskOptions::default())
            .await
            .unwrap();

        let info = client.client().memory().unwrap().session_info();
        assert_eq!(info["mcp_session_id"], "mcp_42");
    }
}
