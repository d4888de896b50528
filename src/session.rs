//! Session execution: the prompt loop and everything one turn needs.
//!
//! - [`SessionPrompt`] owns sessions and runs [`SessionPrompt::prompt`]
//! - the per-turn processor streams the model response and dispatches tool
//!   calls in emission order
//! - [`ToolExecutor`] puts every tool call through the permission pipeline
//! - the retry policy wraps each model-streaming call
//!
//! # Example
//!
//! ```ignore
//! let prompt = SessionPrompt::builder(provider).tools(tools).build();
//! let session = prompt.create_session("my-project");
//! let outcome = prompt.prompt(&session.id, "read a.txt").await?;
//! ```

mod builder;
mod helpers;
mod processor;
mod prompt;
mod retry;
mod tool_execution;
mod types;

#[cfg(test)]
mod test_utils;

pub use builder::SessionPromptBuilder;
pub use prompt::SessionPrompt;
pub use tool_execution::ToolExecutor;
pub use types::{PromptOutcome, StopKind};
