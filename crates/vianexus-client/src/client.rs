use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, error, info};

use vianexus_core::config::AgentConfig;
use vianexus_mcp::{ToolChannelSetup, ToolDescriptor, ToolDispatcher};
use vianexus_memory::{ConversationMemory, MessageRole, UniversalMessage};

use crate::error::{ClientError, Result};
use crate::factory::Provider;
use crate::jwt::extract_system_prompt_from_jwt;
use crate::orchestrator::{run_turn, TurnSettings};
use crate::provider::ModelBackend;

pub const DEFAULT_FINANCIAL_SYSTEM_PROMPT: &str = "You are a skilled Financial Analyst. \
You will use the tools provided to you to answer the question. You will only use the \
tools provided to you and not any other tools that are not provided to you. Use the \
`search` tool to find the appropriate dataset for the question. Use the `fetch` tool \
to fetch the data from the dataset.";

const MAX_QUESTION_CHARS: usize = 100_000;

/// Options for [`AgentClient::ask_question`].
#[derive(Debug, Clone, Copy)]
pub struct AskOptions {
    /// Keep the exchange in the client's conversation buffer.
    pub maintain_history: bool,
    /// Persist the question, assistant turns and tool results.
    pub use_memory: bool,
    /// Replace the buffer with stored history before the first request.
    pub load_from_memory: bool,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self {
            maintain_history: false,
            use_memory: true,
            load_from_memory: true,
        }
    }
}

/// One provider client: a model backend, an optional tool channel, an
/// optional memory facade, and the canonical conversation buffer.
pub struct AgentClient {
    provider: Provider,
    backend: Box<dyn ModelBackend>,
    pub(crate) setup: ToolChannelSetup,
    pub(crate) channel: Option<Arc<dyn ToolDispatcher>>,
    pub(crate) memory: Option<ConversationMemory>,
    messages: Vec<Value>,
    system_prompt: String,
    model: String,
    max_tokens: u32,
    max_history_length: usize,
}

impl AgentClient {
    /// Build a client around an already-constructed backend. The system
    /// prompt resolves config > software-statement JWT > default.
    pub fn with_backend(
        config: &AgentConfig,
        provider: Provider,
        backend: Box<dyn ModelBackend>,
        memory: Option<ConversationMemory>,
    ) -> Self {
        let via_nexus = config.agent_servers.via_nexus.clone();
        let system_prompt = resolve_system_prompt(config, &via_nexus.software_statement);

        Self {
            model: config.model_or(provider.default_model()).to_string(),
            provider,
            backend,
            setup: ToolChannelSetup::new(via_nexus),
            channel: None,
            memory,
            messages: Vec::new(),
            system_prompt,
            max_tokens: config.max_tokens,
            max_history_length: config.max_history_length,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.as_str()
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn memory(&mut self) -> Option<&mut ConversationMemory> {
        self.memory.as_mut()
    }

    pub fn memory_session_id(&self) -> Option<&str> {
        self.memory.as_ref().and_then(|m| m.session_id())
    }

    /// Attach a live tool channel (persistent overlay, tests).
    pub fn set_channel(&mut self, channel: Arc<dyn ToolDispatcher>) {
        self.channel = Some(channel);
    }

    pub fn clear_channel(&mut self) {
        self.channel = None;
    }

    /// Set up authentication. Call once before per-request connections.
    pub async fn initialize(&mut self) -> Result<()> {
        self.setup.create_auth_layer().await?;
        info!("client initialized — establish a persistent connection or use methods directly");
        Ok(())
    }

    /// Close any attached channel and drop it.
    pub async fn cleanup(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close_tolerant().await;
        }
    }

    /// One question, no history, no persistence. Uses the attached channel
    /// when present, otherwise opens a throwaway connection.
    pub async fn ask_single_question(&mut self, question: &str) -> Result<String> {
        let question = validate_question(question)?;

        if let Some(channel) = self.channel.clone() {
            return self.single_question_on(channel.as_ref(), &question).await;
        }

        self.setup.create_auth_layer().await?;
        let channel = self.setup.connect().await?;
        let result = self.single_question_on(&channel, &question).await;
        channel.close_tolerant().await;
        result
    }

    async fn single_question_on(
        &self,
        dispatcher: &dyn ToolDispatcher,
        question: &str,
    ) -> Result<String> {
        let catalogue = catalogue_or_empty(Some(dispatcher)).await;
        let mut buffer = vec![json!({"role": "user", "content": question})];
        run_turn(
            self.backend.as_ref(),
            Some(dispatcher),
            &catalogue,
            &mut buffer,
            &self.turn_settings(false),
            None,
        )
        .await
    }

    /// Ask with optional history and memory integration.
    pub async fn ask_question(&mut self, question: &str, opts: AskOptions) -> Result<String> {
        let question = validate_question(question)?;

        if opts.use_memory && opts.maintain_history && opts.load_from_memory {
            if let Some(memory) = self.memory.as_mut() {
                let history = memory.load_history(None, None).await;
                if !history.is_empty() {
                    debug!(count = history.len(), "loaded conversation history from memory");
                    self.messages = canonical_from_universal(&history);
                }
            }
        }

        if opts.use_memory {
            if let Some(memory) = self.memory.as_mut() {
                memory
                    .save(MessageRole::User, json!(question), None, None)
                    .await;
            }
        }

        if opts.maintain_history {
            self.messages.push(json!({"role": "user", "content": question}));

            let channel = self.channel.clone();
            let catalogue = catalogue_or_empty(channel.as_deref()).await;
            let settings = self.turn_settings(false);
            let memory = if opts.use_memory {
                self.memory.as_mut()
            } else {
                None
            };

            let answer = run_turn(
                self.backend.as_ref(),
                channel.as_deref(),
                &catalogue,
                &mut self.messages,
                &settings,
                memory,
            )
            .await?;

            self.trim_history();
            Ok(answer)
        } else {
            let answer = self.ask_single_question(&question).await?;
            if opts.use_memory {
                if let Some(memory) = self.memory.as_mut() {
                    memory
                        .save(MessageRole::Assistant, json!(answer), None, None)
                        .await;
                }
            }
            Ok(answer)
        }
    }

    /// Streaming turn on the shared buffer; deltas go to stdout, the return
    /// value is empty.
    pub async fn process_query(&mut self, query: &str) -> Result<String> {
        let query = validate_question(query)?;
        self.messages.push(json!({"role": "user", "content": query}));

        let channel = self.channel.clone();
        let catalogue = catalogue_or_empty(channel.as_deref()).await;
        let settings = self.turn_settings(true);

        run_turn(
            self.backend.as_ref(),
            channel.as_deref(),
            &catalogue,
            &mut self.messages,
            &settings,
            None,
        )
        .await?;

        self.trim_history();
        Ok(String::new())
    }

    pub(crate) fn turn_settings(&self, stream: bool) -> TurnSettings {
        TurnSettings {
            model: self.model.clone(),
            system: self.system_prompt.clone(),
            max_tokens: self.max_tokens,
            stream,
        }
    }

    /// Keep the conversation buffer within bounds.
    fn trim_history(&mut self) {
        if self.messages.len() > self.max_history_length {
            self.messages
                .drain(..self.messages.len() - self.max_history_length);
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &[Value] {
        &self.messages
    }
}

/// The per-ask tool catalogue: what the channel reports, or empty when there
/// is no channel or the listing fails (the loop then degenerates to a plain
/// model round trip).
async fn catalogue_or_empty(dispatcher: Option<&dyn ToolDispatcher>) -> Vec<ToolDescriptor> {
    match dispatcher {
        None => Vec::new(),
        Some(dispatcher) => match dispatcher.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                error!(error = %e, "error listing tools");
                Vec::new()
            }
        },
    }
}

/// Render stored history into the canonical buffer shape. Block-array
/// content is kept verbatim so tool-call records replay for every provider.
fn canonical_from_universal(history: &[UniversalMessage]) -> Vec<Value> {
    history
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::Assistant => "assistant",
                _ => "user",
            };
            let content = match &message.content {
                Value::String(s) => json!(s),
                Value::Array(blocks) => json!(blocks),
                other => json!(vianexus_memory::convert::blocks_to_text(other)),
            };
            json!({"role": role, "content": content})
        })
        .collect()
}

/// Priority: explicit config > software-statement JWT claim > the default
/// financial-analyst prompt.
fn resolve_system_prompt(config: &AgentConfig, software_statement: &str) -> String {
    if let Some(prompt) = &config.system_prompt {
        return prompt.clone();
    }
    if let Some(prompt) = extract_system_prompt_from_jwt(software_statement) {
        info!("using system prompt from software_statement JWT");
        return prompt;
    }
    debug!("using default financial system prompt");
    DEFAULT_FINANCIAL_SYSTEM_PROMPT.to_string()
}

/// Reject empty, oversized and NUL-carrying input; returns the trimmed
/// question.
pub(crate) fn validate_question(question: &str) -> Result<String> {
    let question = question.trim();
    if question.is_empty() {
        return Err(ClientError::Validation(
            "question cannot be empty or whitespace only".to_string(),
        ));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(ClientError::Validation(format!(
            "question is too long (max {MAX_QUESTION_CHARS} characters)"
        )));
    }
    if question.contains('\0') {
        return Err(ClientError::Validation(
            "question contains null bytes".to_string(),
        ));
    }
    Ok(question.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use vianexus_memory::{HistoryFilter, InMemoryStore, MemoryStore, MessageType};

    use crate::testing::{text_reply, tool_reply, FixedDispatcher, ScriptedBackend};

    fn test_config() -> AgentConfig {
        AgentConfig::from_json_value(json!({
            "LLM_API_KEY": "sk-ant-test",
            "LLM_MODEL": "claude-sonnet-4-20250514",
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

    fn client_with(
        replies: Vec<crate::provider::TurnReply>,
        memory: Option<ConversationMemory>,
    ) -> AgentClient {
        AgentClient::with_backend(
            &test_config(),
            Provider::Anthropic,
            Box::new(ScriptedBackend::new(replies)),
            memory,
        )
    }

    fn memory_on(store: Arc<dyn MemoryStore>, session_id: &str) -> ConversationMemory {
        ConversationMemory::new(
            store,
            Some(session_id.to_string()),
            Some("u1".to_string()),
            "anthropic",
        )
    }

    #[test]
    fn validation_boundaries() {
        assert!(validate_question("  ").is_err());
        assert!(validate_question("bad\0input").is_err());

        let at_limit = "x".repeat(MAX_QUESTION_CHARS);
        assert!(validate_question(&at_limit).is_ok());
        let over_limit = "x".repeat(MAX_QUESTION_CHARS + 1);
        assert!(validate_question(&over_limit).is_err());

        assert_eq!(validate_question("  ok  ").unwrap(), "ok");
    }

    #[test]
    fn system_prompt_priority_order() {
        let mut config = test_config();

        // explicit config wins
        config.system_prompt = Some("explicit".to_string());
        assert_eq!(resolve_system_prompt(&config, "not.a.jwt"), "explicit");

        // JWT claim next
        config.system_prompt = None;
        let jwt = {
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            use base64::Engine;
            let payload = URL_SAFE_NO_PAD.encode(json!({"system_prompt": "from jwt"}).to_string());
            format!("h.{payload}.s")
        };
        assert_eq!(resolve_system_prompt(&config, &jwt), "from jwt");

        // default last
        assert_eq!(
            resolve_system_prompt(&config, "not.a.jwt"),
            DEFAULT_FINANCIAL_SYSTEM_PROMPT
        );
    }

    #[tokio::test]
    async fn tool_loop_buffer_shape_and_answer() {
        let mut client = client_with(
            vec![
                tool_reply("t1", "fetch", json!({"symbol": "V"})),
                text_reply("done"),
            ],
            None,
        );
        let dispatcher = Arc::new(FixedDispatcher::new(json!([{"text": "42"}])));
        client.set_channel(dispatcher.clone());

        let answer = client
            .ask_question(
                "quote V",
                AskOptions {
                    maintain_history: true,
                    use_memory: false,
                    load_from_memory: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(answer, "done");
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        let buffer = client.buffer();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer[0]["role"], "user");
        assert_eq!(buffer[1]["content"][0]["type"], "tool_use");
        assert_eq!(buffer[2]["content"][0]["type"], "tool_result");
        assert_eq!(buffer[3]["content"][0]["text"], "done");
    }

    #[tokio::test]
    async fn memory_persists_question_tools_and_answer() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let mut client = client_with(
            vec![
                tool_reply("t1", "fetch", json!({"symbol": "V"})),
                text_reply("done"),
            ],
            Some(memory_on(store.clone(), "s1")),
        );
        client.set_channel(Arc::new(FixedDispatcher::new(json!([{"text": "42"}]))));

        client
            .ask_question(
                "quote V",
                AskOptions {
                    maintain_history: true,
                    use_memory: true,
                    load_from_memory: true,
                },
            )
            .await
            .unwrap();

        let history = store
            .get_conversation_history("s1", HistoryFilter::default())
            .await
            .unwrap();
        // user, assistant(tool_call), tool_result, assistant(text)
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].message_type, MessageType::ToolCall);
        assert_eq!(history[2].message_type, MessageType::ToolResult);
        assert_eq!(history[3].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn empty_store_buffer_begins_with_the_question() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let mut client = client_with(
            vec![text_reply("hello")],
            Some(memory_on(store, "fresh")),
        );
        client.set_channel(Arc::new(FixedDispatcher::new(json!([]))));

        client
            .ask_question("first question", AskOptions::default().with_history())
            .await
            .unwrap();

        assert_eq!(client.buffer()[0]["content"], "first question");
    }

    #[tokio::test]
    async fn history_reloads_from_memory_across_clients() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());

        let mut first = client_with(
            vec![text_reply("the answer is 42")],
            Some(memory_on(store.clone(), "s1")),
        );
        first.set_channel(Arc::new(FixedDispatcher::new(json!([]))));
        first
            .ask_question("what is the answer?", AskOptions::default().with_history())
            .await
            .unwrap();

        let mut second = client_with(
            vec![text_reply("as I said, 42")],
            Some(memory_on(store, "s1")),
        );
        second.set_channel(Arc::new(FixedDispatcher::new(json!([]))));
        second
            .ask_question("repeat that", AskOptions::default().with_history())
            .await
            .unwrap();

        // prior user + assistant turns, then the new exchange
        let buffer = second.buffer();
        assert!(buffer.len() >= 4);
        assert_eq!(buffer[0]["content"], "what is the answer?");
    }

    #[tokio::test]
    async fn no_history_mode_still_persists_for_search() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let mut client = client_with(
            vec![text_reply("persisted answer")],
            Some(memory_on(store.clone(), "s1")),
        );
        client.set_channel(Arc::new(FixedDispatcher::new(json!([]))));

        let answer = client
            .ask_question("searchable question", AskOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, "persisted answer");

        // buffer untouched, memory written
        assert!(client.buffer().is_empty());
        let history = store
            .get_conversation_history("s1", HistoryFilter::default())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, json!("searchable question"));
        assert_eq!(history[1].content, json!("persisted answer"));
    }

    #[tokio::test]
    async fn buffer_is_trimmed_to_max_history_length() {
        let mut config = test_config();
        config.max_history_length = 3;
        let replies: Vec<_> = (0..4).map(|i| text_reply(&format!("r{i}"))).collect();
        let mut client = AgentClient::with_backend(
            &config,
            Provider::Anthropic,
            Box::new(ScriptedBackend::new(replies)),
            None,
        );
        client.set_channel(Arc::new(FixedDispatcher::new(json!([]))));

        for i in 0..4 {
            client
                .ask_question(
                    &format!("q{i}"),
                    AskOptions {
                        maintain_history: true,
                        use_memory: false,
                        load_from_memory: false,
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(client.buffer().len(), 3);
        assert_eq!(client.buffer()[2]["content"][0]["text"], "r3");
    }

    #[tokio::test]
    async fn cross_provider_replay_preserves_text() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());

        let mut anthropic = client_with(
            vec![text_reply("markets are up")],
            Some(memory_on(store.clone(), "shared")),
        );
        anthropic.set_channel(Arc::new(FixedDispatcher::new(json!([]))));
        anthropic
            .ask_question("how are markets?", AskOptions::default().with_history())
            .await
            .unwrap();

        let mut gemini = AgentClient::with_backend(
            &test_config(),
            Provider::Gemini,
            Box::new(ScriptedBackend::new(vec![text_reply("still up")])),
            Some(ConversationMemory::new(
                store,
                Some("shared".to_string()),
                Some("u1".to_string()),
                "gemini",
            )),
        );

        let replayed = gemini
            .memory()
            .unwrap()
            .load_history_in_provider_format(None, None)
            .await;
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0]["role"], "user");
        assert_eq!(replayed[0]["parts"][0]["text"], "how are markets?");
        assert_eq!(replayed[1]["role"], "model");
        assert_eq!(replayed[1]["parts"][0]["text"], "markets are up");
    }

    #[tokio::test]
    async fn process_query_returns_empty_and_keeps_history() {
        let mut client = client_with(vec![text_reply("streamed")], None);
        client.set_channel(Arc::new(FixedDispatcher::new(json!([]))));

        let out = client.process_query("stream this").await.unwrap();
        assert!(out.is_empty());
        assert_eq!(client.buffer().len(), 2);
    }

    impl AskOptions {
        fn with_history(mut self) -> Self {
            self.maintain_history = true;
            self
        }
    }
}
