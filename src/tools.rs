//! Tool definition and registry.
//!
//! - [`Tool`] trait - Define tools the model can call
//! - [`ToolName`] trait - Marker trait for strongly-typed tool names
//! - [`DynamicToolName`] - Names created at runtime (MCP-routed tools)
//! - [`ToolRegistry`] - Name-keyed collection of available tools
//! - [`ToolContext`] - Per-call context passed to execution
//!
//! # Implementing a Tool
//!
//! ```ignore
//! use agent_runtime::{Tool, ToolContext, ToolOutput, DynamicToolName};
//!
//! struct ReadFile;
//!
//! impl Tool for ReadFile {
//!     type Name = DynamicToolName;
//!
//!     fn name(&self) -> DynamicToolName { DynamicToolName::new("read") }
//!     fn description(&self) -> &'static str { "Read a file" }
//!     fn input_schema(&self) -> Value { json!({ "type": "object" }) }
//!     fn permission_pattern(&self, input: &Value) -> String {
//!         input["path"].as_str().unwrap_or("*").to_string()
//!     }
//!
//!     async fn execute(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
//!         Ok(ToolOutput::new("contents").with_title("a.txt"))
//!     }
//! }
//! ```

use crate::bus::{BusEvent, EventBus, Scope};
use crate::llm::ToolDefinition;
use crate::types::{MessageId, SessionId};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Marker trait for tool names.
///
/// The string form sent to the model is the serde serialization of the name.
pub trait ToolName: Send + Sync + Serialize + DeserializeOwned + 'static {}

/// String form of a tool name. Names that do not serialize to a JSON
/// string fall back to their JSON text.
#[must_use]
pub fn tool_name_to_string<N: ToolName>(name: &N) -> String {
    match serde_json::to_value(name) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(e) => {
            log::warn!("Tool name failed to serialize (error={e})");
            String::new()
        }
    }
}

/// Parse a tool name from its string form.
///
/// # Errors
/// Returns error if the string doesn't match a valid tool name.
pub fn tool_name_from_str<N: ToolName>(s: &str) -> Result<N, serde_json::Error> {
    serde_json::from_value(Value::String(s.to_string()))
}

/// Tool name chosen at runtime, e.g. for tools routed to an MCP server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DynamicToolName(String);

impl DynamicToolName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ToolName for DynamicToolName {}

/// Result of a successful tool call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: String,
    pub title: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ToolOutput {
    #[must_use]
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Context passed to tool execution
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub project_id: String,
    /// Assistant message that issued the call
    pub message_id: MessageId,
    pub call_id: String,
    /// Fires when the session is interrupted. Long-running tools should
    /// watch it; the runtime never aborts a tool mid-execution.
    pub cancel: CancellationToken,
    bus: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("session_id", &self.session_id)
            .field("project_id", &self.project_id)
            .field("message_id", &self.message_id)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl ToolContext {
    #[must_use]
    pub fn new(
        session_id: SessionId,
        project_id: impl Into<String>,
        message_id: MessageId,
        call_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            project_id: project_id.into(),
            message_id,
            call_id: call_id.into(),
            cancel: CancellationToken::new(),
            bus: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Publish a custom event under this call's session scope.
    ///
    /// Tools use this for progress reporting. Events whose type is not
    /// defined on the bus are dropped with a warning.
    pub fn emit<E: BusEvent>(&self, event: &E) {
        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(e) = bus.publish_event(event, &Scope::session(&self.session_id)) {
            log::warn!(
                "Tool event dropped (call_id={}, event_type={}, error={e})",
                self.call_id,
                E::TYPE
            );
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A tool the model can call.
///
/// Implementations use native async functions in traits; no `async_trait`
/// attribute is needed.
pub trait Tool: Send + Sync {
    type Name: ToolName;

    fn name(&self) -> Self::Name;

    fn description(&self) -> &'static str;

    /// JSON schema for the tool's input parameters.
    fn input_schema(&self) -> Value;

    /// Permission type checked before execution. `None` uses the tool name.
    fn permission(&self) -> Option<&'static str> {
        None
    }

    /// Pattern matched against permission rules, derived from the input
    /// (a path, a command). Defaults to `*`.
    fn permission_pattern(&self, _input: &Value) -> String {
        "*".to_string()
    }

    /// Execute the tool with the given input.
    ///
    /// # Errors
    /// Any error becomes a recoverable tool failure fed back to the model.
    fn execute(
        &self,
        ctx: &ToolContext,
        input: Value,
    ) -> impl Future<Output = Result<ToolOutput>> + Send;
}

/// Object-safe view of a [`Tool`] stored in the registry.
#[async_trait]
pub trait ErasedTool: Send + Sync {
    fn name_str(&self) -> &str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;
    fn permission(&self) -> &str;
    fn permission_pattern(&self, input: &Value) -> String;
    async fn execute(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput>;
}

struct ToolWrapper<T: Tool> {
    inner: T,
    name_cache: String,
    permission_cache: String,
}

impl<T: Tool> ToolWrapper<T> {
    fn new(tool: T) -> Self {
        let name_cache = tool_name_to_string(&tool.name());
        let permission_cache = tool
            .permission()
            .map_or_else(|| name_cache.clone(), str::to_string);
        Self {
            inner: tool,
            name_cache,
            permission_cache,
        }
    }
}

#[async_trait]
impl<T: Tool + 'static> ErasedTool for ToolWrapper<T> {
    fn name_str(&self) -> &str {
        &self.name_cache
    }

    fn description(&self) -> &'static str {
        self.inner.description()
    }

    fn input_schema(&self) -> Value {
        self.inner.input_schema()
    }

    fn permission(&self) -> &str {
        &self.permission_cache
    }

    fn permission_pattern(&self, input: &Value) -> String {
        self.inner.permission_pattern(input)
    }

    async fn execute(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        self.inner.execute(ctx, input).await
    }
}

/// Registry of available tools, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ErasedTool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register<T>(&mut self, tool: T) -> &mut Self
    where
        T: Tool + 'static,
    {
        self.register_erased(Arc::new(ToolWrapper::new(tool)))
    }

    /// Register an already type-erased tool, e.g. a bridge to a remote
    /// tool server.
    pub fn register_erased(&mut self, tool: Arc<dyn ErasedTool>) -> &mut Self {
        let name = tool.name_str().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            log::debug!("Replaced tool registration (tool={name})");
        }
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ErasedTool>> {
        self.tools.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ErasedTool>> {
        self.tools.values()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// `(tool name, permission type)` pairs, for rule-based filtering.
    pub fn permissions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tools.values().map(|t| (t.name_str(), t.permission()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Remove tools for which the predicate returns false.
    pub fn filter<F>(&mut self, predicate: F)
    where
        F: Fn(&str) -> bool,
    {
        self.tools.retain(|name, _| predicate(name));
    }

    /// Definitions offered to the model, sorted by name, minus `hidden`.
    #[must_use]
    pub fn definitions(&self, hidden: &HashSet<String>) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self
            .tools
            .values()
            .filter(|tool| !hidden.contains(tool.name_str()))
            .map(|tool| ToolDefinition {
                name: tool.name_str().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}
