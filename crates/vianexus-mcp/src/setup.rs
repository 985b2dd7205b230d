use std::sync::Arc;

use tracing::debug;
use vianexus_core::config::ViaNexusConfig;

use crate::auth::{AccessTokenProvider, SoftwareStatementAuth};
use crate::channel::ToolChannel;
use crate::error::{ChannelError, Result};

/// Ensure a scheme for URL composition; `https` when none is given.
fn normalize_server(server: &str) -> String {
    let trimmed = server.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Owns OAuth setup and opens streamable-HTTP transports to the MCP server.
/// One setup can open any number of channels; each `connect` yields a fresh
/// transport session.
pub struct ToolChannelSetup {
    config: ViaNexusConfig,
    base_url: String,
    auth: Option<Arc<dyn AccessTokenProvider>>,
}

impl ToolChannelSetup {
    pub fn new(config: ViaNexusConfig) -> Self {
        let base_url = normalize_server(&config.server_url);
        Self {
            config,
            base_url,
            auth: None,
        }
    }

    /// Inject a pre-built auth layer (tests, custom OAuth flows).
    pub fn with_auth(config: ViaNexusConfig, auth: Arc<dyn AccessTokenProvider>) -> Self {
        let mut setup = Self::new(config);
        setup.auth = Some(auth);
        setup
    }

    pub fn software_statement(&self) -> &str {
        &self.config.software_statement
    }

    /// `<scheme>://<host>:<port>/mcp`
    pub fn endpoint(&self) -> String {
        format!("{}:{}/mcp", self.base_url, self.config.server_port)
    }

    /// Server origin including the port, for the OAuth token endpoint.
    fn origin(&self) -> String {
        format!("{}:{}", self.base_url, self.config.server_port)
    }

    /// `X-Tool-Categories` value: "financial", plus "openbb" for OpenBB
    /// client contexts.
    pub fn tool_categories(&self) -> String {
        let mut categories = vec!["financial"];
        let is_openbb = self
            .config
            .client_context
            .as_ref()
            .and_then(|c| c.context_type.as_deref())
            == Some("openbb");
        if is_openbb {
            categories.push("openbb");
        }
        categories.join(",")
    }

    /// Initialize the OAuth client. Idempotent.
    pub async fn create_auth_layer(&mut self) -> Result<Arc<dyn AccessTokenProvider>> {
        if let Some(auth) = &self.auth {
            return Ok(auth.clone());
        }
        let auth: Arc<dyn AccessTokenProvider> = Arc::new(SoftwareStatementAuth::new(
            &self.origin(),
            self.config.software_statement.clone(),
        ));
        self.auth = Some(auth.clone());
        debug!("auth layer initialized");
        Ok(auth)
    }

    pub fn auth_layer(&self) -> Option<Arc<dyn AccessTokenProvider>> {
        self.auth.clone()
    }

    /// Open the transport and perform the MCP initialize handshake.
    /// Requires `create_auth_layer` to have succeeded.
    pub async fn connect(&self) -> Result<ToolChannel> {
        let auth = self
            .auth
            .clone()
            .ok_or_else(|| ChannelError::Auth("auth not initialized; call create_auth_layer first".to_string()))?;

        let mut channel = ToolChannel::new(self.endpoint(), self.tool_categories(), auth);
        channel.connect().await?;
        Ok(channel)
    }
}
