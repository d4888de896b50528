//! Context size management for long-running sessions.
//!
//! After a prompt loop ends the session checks its history against the
//! model's limits:
//! 1. Old completed tool outputs are pruned (cleared in place)
//! 2. If the history still overflows, a [`ContextCompactor`] replaces it
//!
//! Summarization itself is a collaborator concern; [`PlaceholderCompactor`]
//! keeps the recent messages and folds older ones into one summary message.

mod compactor;
mod config;
mod estimator;

pub use compactor::{
    CompactionResult, ContextCompactor, PRUNED_OUTPUT, PlaceholderCompactor, PruneResult,
    prune_tool_outputs,
};
pub use config::CompactionConfig;
pub use estimator::TokenEstimator;
