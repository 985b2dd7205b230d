use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_MAX_HISTORY_LENGTH: usize = 50;

/// Top-level client configuration (vianexus.toml + VIANEXUS_* env overrides).
///
/// Field names accept both the canonical snake_case spelling and the legacy
/// `LLM_API_KEY` / `agentServers` spellings used by existing deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(alias = "LLM_API_KEY")]
    pub llm_api_key: String,

    /// Model identifier. Defaults per provider when absent.
    #[serde(default, alias = "LLM_MODEL")]
    pub llm_model: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Conversation buffer cap — older entries are dropped after each turn.
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,

    /// Explicit system prompt. Overrides the software-statement JWT claim.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Explicit provider name ("anthropic" | "openai" | "gemini").
    /// When absent the factory detects the provider from model/key patterns.
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(alias = "agentServers")]
    pub agent_servers: AgentServers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServers {
    #[serde(alias = "viaNexus")]
    pub via_nexus: ViaNexusConfig,
}

/// Connection parameters for the viaNexus MCP tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViaNexusConfig {
    /// Host or URL of the tool server. `https` is assumed when no scheme
    /// is given.
    pub server_url: String,
    pub server_port: u16,
    /// Software-statement JWT presented during OAuth bootstrap. May carry a
    /// `system_prompt` claim.
    pub software_statement: String,
    #[serde(default)]
    pub client_context: Option<ClientContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientContext {
    /// Client flavour, e.g. "openbb". Widens the tool-category filter.
    #[serde(default, rename = "type")]
    pub context_type: Option<String>,
}

/// Memory subsystem selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub store_type: StoreType,
    /// Root directory for the file-backed store.
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    #[default]
    InMemory,
    File,
    None,
}

impl AgentConfig {
    /// Figment stack: `vianexus.toml` overridden by `VIANEXUS_*` env vars
    /// (double underscore separates nesting levels).
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Toml::file("vianexus.toml"))
            .merge(Env::prefixed("VIANEXUS_").split("__"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self::figment().extract()?)
    }

    pub fn from_toml_file(path: &str) -> Result<Self, ConfigError> {
        Ok(Figment::from(Toml::file(path))
            .merge(Env::prefixed("VIANEXUS_").split("__"))
            .extract()?)
    }

    /// Build from an already-parsed JSON value (e.g. an embedding host's own
    /// configuration tree).
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// The configured model, or the given provider default.
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.llm_model.as_deref().unwrap_or(default)
    }
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_max_history_length() -> usize {
    DEFAULT_MAX_HISTORY_LENGTH
}
