//! Agent runtime - the execution core of a tool-using LLM agent.
//!
//! This crate drives the agentic loop:
//! - Multi-turn prompt loop with interrupt, turn ceiling and compaction
//! - Streaming turn processing with tool-call fragment accumulation
//! - Human-in-the-loop permission gate with scoped memory of approvals
//! - Doom-loop detection over repeated identical tool calls
//! - Scoped publish/subscribe event bus exposing execution state
//! - Retry with exponential backoff around model-streaming calls
//!
//! Model vendors, UIs and storage engines are collaborators: implement
//! [`LlmProvider`], subscribe to the [`EventBus`], and implement
//! [`MessageStore`] / [`Storage`].
//!
//! # Example
//!
//! ```ignore
//! use agent_runtime::{AgentConfig, PermissionReply, Ruleset, SessionPrompt, ToolRegistry};
//! use agent_runtime::events::PermissionAsked;
//!
//! let prompt = SessionPrompt::builder(provider)
//!     .tools(tools)
//!     .rules(Ruleset::from_config(&serde_json::json!({"read": "ask"}))?)
//!     .config(AgentConfig::default())
//!     .build();
//!
//! let (_handle, mut events) = prompt.bus().subscribe_channel(None);
//! let session = prompt.create_session("my-project");
//! let outcome = prompt.prompt(&session.id, "Summarize a.txt").await?;
//!
//! while let Ok(event) = events.try_recv() {
//!     if let Some(asked) = event.decode::<PermissionAsked>() {
//!         prompt.guard().reply(&asked.id, PermissionReply::Once, None).await?;
//!     }
//! }
//! ```

#![forbid(unsafe_code)]

pub mod bus;
pub mod context;
mod doom_loop;
mod error;
pub mod events;
pub mod llm;
mod message;
pub mod permission;
pub mod session;
mod stores;
mod tools;
mod types;

pub use bus::{BusEvent, EventBus, EventEnvelope, Scope, SubscriptionHandle};
pub use doom_loop::{DoomLoopDetector, DoomSignature};
pub use error::{AgentError, ErrorCode, ProviderError, ProviderErrorKind};
pub use llm::LlmProvider;
pub use message::{Message, Part, PartKind, Role, ToolState};
pub use permission::{
    AskReason, Effect, MemoryScope, PermissionGuard, PermissionReply, PermissionRequest,
    PermissionRule, Ruleset,
};
pub use session::{PromptOutcome, SessionPrompt, SessionPromptBuilder, StopKind, ToolExecutor};
pub use stores::{InMemoryStore, MessageStore, Storage, UpdateFn};
pub use tools::{
    DynamicToolName, ErasedTool, Tool, ToolContext, ToolName, ToolOutput, ToolRegistry,
    tool_name_from_str, tool_name_to_string,
};
pub use types::{
    AgentConfig, DoomLoopConfig, MessageId, PartId, RequestId, RetryConfig, SessionId,
    SessionInfo, SessionStatus, TokenUsage,
};
