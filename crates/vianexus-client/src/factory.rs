use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use vianexus_core::config::{AgentConfig, StoreType};
use vianexus_memory::{ConversationMemory, FileMemoryStore, InMemoryStore, MemoryStore};

use crate::anthropic::AnthropicBackend;
use crate::client::AgentClient;
use crate::error::{ClientError, Result};
use crate::gemini::GeminiBackend;
use crate::openai::OpenAiBackend;
use crate::persistent::PersistentClient;
use crate::provider::ModelBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => crate::anthropic::DEFAULT_MODEL,
            Self::OpenAi => crate::openai::DEFAULT_MODEL,
            Self::Gemini => crate::gemini::DEFAULT_MODEL,
        }
    }

    pub fn all() -> &'static [Provider] {
        &[Self::Anthropic, Self::OpenAi, Self::Gemini]
    }
}

impl FromStr for Provider {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const OPENAI_MODEL_PREFIXES: &[&str] = &[
    "gpt-",
    "o1-",
    "text-davinci",
    "text-curie",
    "text-babbage",
    "text-ada",
];
const ANTHROPIC_MODEL_PREFIXES: &[&str] = &["claude-", "claude_"];
const GEMINI_MODEL_PREFIXES: &[&str] = &["gemini-", "gemini_", "bison", "gecko"];

/// Detect the provider from configuration, in priority order: explicit
/// `provider` field, model-name prefix, API-key prefix, then a provider name
/// anywhere in the serialized config.
pub fn detect_provider(config: &AgentConfig) -> Result<Provider> {
    if let Some(name) = &config.provider {
        let provider = name
            .parse()
            .map_err(|_| ClientError::ProviderDetection(format!("unknown provider specified: {name}")))?;
        info!(provider = %name, "provider explicitly specified");
        return Ok(provider);
    }

    let model = config.llm_model.as_deref().unwrap_or("").to_lowercase();
    if !model.is_empty() {
        let by_model = if OPENAI_MODEL_PREFIXES.iter().any(|p| model.starts_with(p)) {
            Some(Provider::OpenAi)
        } else if ANTHROPIC_MODEL_PREFIXES.iter().any(|p| model.starts_with(p)) {
            Some(Provider::Anthropic)
        } else if GEMINI_MODEL_PREFIXES.iter().any(|p| model.starts_with(p)) {
            Some(Provider::Gemini)
        } else {
            None
        };
        if let Some(provider) = by_model {
            info!(model = %model, provider = provider.as_str(), "provider detected from model name");
            return Ok(provider);
        }
    }

    // key prefixes: the anthropic prefix is a prefix of the openai one,
    // so it must be tested first
    let key = &config.llm_api_key;
    if !key.is_empty() {
        let by_key = if key.starts_with("sk-ant-") {
            Some(Provider::Anthropic)
        } else if key.starts_with("sk-") || key.starts_with("sk_") {
            Some(Provider::OpenAi)
        } else if key.starts_with("AI") {
            Some(Provider::Gemini)
        } else {
            None
        };
        if let Some(provider) = by_key {
            info!(provider = provider.as_str(), "provider detected from API key pattern");
            return Ok(provider);
        }
    }

    let serialized = serde_json::to_string(config)
        .unwrap_or_default()
        .to_lowercase();
    for provider in Provider::all() {
        if serialized.contains(provider.as_str()) {
            info!(provider = provider.as_str(), "provider detected from config content");
            return Ok(*provider);
        }
    }

    Err(ClientError::ProviderDetection(format!(
        "specify 'provider' in config or use a recognizable LLM_MODEL/LLM_API_KEY; \
         supported providers: {:?}",
        Provider::all()
            .iter()
            .map(Provider::as_str)
            .collect::<Vec<_>>()
    )))
}

fn backend_for(provider: Provider, config: &AgentConfig) -> Box<dyn ModelBackend> {
    let api_key = config.llm_api_key.clone();
    match provider {
        Provider::Anthropic => Box::new(AnthropicBackend::new(api_key, None)),
        Provider::OpenAi => Box::new(OpenAiBackend::new(api_key, None)),
        Provider::Gemini => Box::new(GeminiBackend::new(api_key, None)),
    }
}

/// Creates clients wired for the detected (or specified) provider.
pub struct ClientFactory;

impl ClientFactory {
    /// Standard client with a fresh in-memory store.
    pub fn create_client(
        config: &AgentConfig,
        memory_session_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<AgentClient> {
        let provider = detect_provider(config)?;
        info!(provider = provider.as_str(), "creating client with in-memory store");
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        Ok(Self::assemble(config, provider, Some(store), memory_session_id, user_id))
    }

    /// Client honoring `config.memory` (`in_memory` | `file` | `none`).
    pub async fn create_client_with_memory(
        config: &AgentConfig,
        memory_session_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<AgentClient> {
        let provider = detect_provider(config)?;
        let store = Self::resolve_store(config).await?;
        Ok(Self::assemble(config, provider, store, memory_session_id, user_id))
    }

    /// Client with a caller-supplied store (S3-alikes, shared stores).
    pub fn create_client_with_store(
        config: &AgentConfig,
        store: Arc<dyn MemoryStore>,
        memory_session_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<AgentClient> {
        let provider = detect_provider(config)?;
        info!(provider = provider.as_str(), "creating client with provided memory store");
        Ok(Self::assemble(config, provider, Some(store), memory_session_id, user_id))
    }

    /// Stateless client — no memory system at all.
    pub fn create_client_without_memory(config: &AgentConfig) -> Result<AgentClient> {
        let provider = detect_provider(config)?;
        info!(provider = provider.as_str(), "creating client without memory");
        Ok(Self::assemble(config, provider, None, None, None))
    }

    /// Persistent overlay with a fresh in-memory store.
    pub fn create_persistent_client(
        config: &AgentConfig,
        memory_session_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<PersistentClient> {
        let client = Self::create_client(config, memory_session_id, user_id)?;
        Ok(PersistentClient::new(client))
    }

    /// Persistent overlay honoring `config.memory`.
    pub async fn create_persistent_client_with_memory(
        config: &AgentConfig,
        memory_session_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<PersistentClient> {
        let client = Self::create_client_with_memory(config, memory_session_id, user_id).await?;
        Ok(PersistentClient::new(client))
    }

    pub fn supported_providers() -> Vec<&'static str> {
        Provider::all().iter().map(Provider::as_str).collect()
    }

    async fn resolve_store(config: &AgentConfig) -> Result<Option<Arc<dyn MemoryStore>>> {
        match config.memory.store_type {
            StoreType::InMemory => {
                info!("using in-memory store for conversation memory");
                Ok(Some(Arc::new(InMemoryStore::new())))
            }
            StoreType::File => {
                let path = config
                    .memory
                    .file_path
                    .clone()
                    .unwrap_or_else(|| "conversations".to_string());
                info!(path = %path, "using file memory store");
                let store = FileMemoryStore::new(path).await?;
                Ok(Some(Arc::new(store)))
            }
            StoreType::None => {
                info!("memory system disabled");
                Ok(None)
            }
        }
    }

    fn assemble(
        config: &AgentConfig,
        provider: Provider,
        store: Option<Arc<dyn MemoryStore>>,
        memory_session_id: Option<String>,
        user_id: Option<String>,
    ) -> AgentClient {
        let memory = store.map(|store| {
            ConversationMemory::new(store, memory_session_id, user_id, provider.as_str())
        });
        debug!(provider = provider.as_str(), "assembling agent client");
        AgentClient::with_backend(config, provider, backend_for(provider, config), memory)
    }
}
