use crate::bus::EventBus;
use crate::context::{ContextCompactor, PlaceholderCompactor};
use crate::doom_loop::DoomLoopDetector;
use crate::llm::LlmProvider;
use crate::permission::{PermissionGuard, Ruleset};
use crate::stores::{InMemoryStore, MessageStore, Storage};
use crate::tools::ToolRegistry;
use crate::types::AgentConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::SessionPrompt;
use super::tool_execution::ToolExecutor;

/// Builder for [`SessionPrompt`].
///
/// Everything except the provider has a default: an empty tool registry,
/// a bus with the built-in event types, one [`InMemoryStore`] for both
/// permission memory and history, and a [`PlaceholderCompactor`].
///
/// # Example
///
/// ```ignore
/// let prompt = SessionPrompt::builder(provider)
///     .tools(registry)
///     .rules(Ruleset::from_config(&json!({"read": "allow", "bash": "ask"}))?)
///     .config(AgentConfig::default().with_continue_loop_on_deny(true))
///     .build();
/// ```
pub struct SessionPromptBuilder {
    provider: Arc<dyn LlmProvider>,
    tools: Option<ToolRegistry>,
    bus: Option<Arc<EventBus>>,
    storage: Option<Arc<dyn Storage>>,
    messages: Option<Arc<dyn MessageStore>>,
    compactor: Option<Arc<dyn ContextCompactor>>,
    rules: Ruleset,
    user_rules: Ruleset,
    config: Option<AgentConfig>,
}

impl SessionPromptBuilder {
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            tools: None,
            bus: None,
            storage: None,
            messages: None,
            compactor: None,
            rules: Ruleset::new(),
            user_rules: Ruleset::new(),
            config: None,
        }
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Share an existing bus, e.g. one a UI bridge already subscribed to.
    #[must_use]
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Store for persisted permission approvals.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn messages(mut self, messages: Arc<dyn MessageStore>) -> Self {
        self.messages = Some(messages);
        self
    }

    #[must_use]
    pub fn compactor(mut self, compactor: Arc<dyn ContextCompactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    /// Agent-level default rules.
    #[must_use]
    pub fn rules(mut self, rules: Ruleset) -> Self {
        self.rules = rules;
        self
    }

    /// User rules, evaluated after the agent defaults (so they win).
    #[must_use]
    pub fn user_rules(mut self, rules: Ruleset) -> Self {
        self.user_rules = rules;
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn build(self) -> SessionPrompt {
        let config = self.config.unwrap_or_default();
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(EventBus::with_builtin_events()));

        let shared_store = Arc::new(InMemoryStore::new());
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::clone(&shared_store) as Arc<dyn Storage>);
        let messages = self
            .messages
            .unwrap_or_else(|| shared_store as Arc<dyn MessageStore>);
        let compactor = self.compactor.unwrap_or_else(|| {
            Arc::new(PlaceholderCompactor::from_config(&config.compaction)) as Arc<dyn ContextCompactor>
        });

        let tools = Arc::new(self.tools.unwrap_or_default());
        let guard = Arc::new(PermissionGuard::new(
            Arc::clone(&bus),
            storage,
            config.memory_scope,
        ));
        let doom = Arc::new(DoomLoopDetector::new(config.doom_loop));
        let executor = ToolExecutor::new(
            Arc::clone(&tools),
            Arc::clone(&guard),
            Arc::clone(&doom),
            Arc::clone(&bus),
        );

        SessionPrompt {
            provider: self.provider,
            tools,
            bus,
            messages,
            compactor,
            guard,
            doom,
            executor,
            rules: Ruleset::merge(&[&self.rules, &self.user_rules]),
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}
