//! Context compaction and tool-output pruning.

use crate::message::{Message, PartKind, Role, ToolState};
use crate::types::SessionId;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write;

use super::config::CompactionConfig;
use super::estimator::TokenEstimator;

/// Text left in place of a pruned tool output.
pub const PRUNED_OUTPUT: &str = "[Old tool result content cleared]";

const SUMMARY_LINE_CHARS: usize = 200;

/// Strategy that shrinks a session's history once it overflows.
#[async_trait]
pub trait ContextCompactor: Send + Sync {
    /// Produce the replacement history.
    ///
    /// # Errors
    /// Returns an error if summarization fails; the history is then left as is.
    async fn compact_history(
        &self,
        session_id: &SessionId,
        messages: Vec<Message>,
    ) -> Result<CompactionResult>;
}

/// Result of a compaction operation.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub messages: Vec<Message>,
    pub original_count: usize,
    pub new_count: usize,
    pub original_tokens: u64,
    pub new_tokens: u64,
}

/// Keeps the most recent messages and folds the rest into one system
/// summary message built from truncated message text.
#[derive(Debug, Clone)]
pub struct PlaceholderCompactor {
    retain_recent: usize,
}

impl PlaceholderCompactor {
    #[must_use]
    pub const fn new(retain_recent: usize) -> Self {
        Self { retain_recent }
    }

    #[must_use]
    pub const fn from_config(config: &CompactionConfig) -> Self {
        Self::new(config.retain_recent)
    }

    fn format_messages_for_summary(messages: &[Message]) -> String {
        let mut output = String::new();

        for message in messages {
            let role = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };

            for part in &message.parts {
                match &part.kind {
                    PartKind::Text { text } => {
                        let _ = writeln!(output, "{role}: {}", truncate(text));
                    }
                    PartKind::Reasoning { .. } => {}
                    PartKind::Tool { tool, state, .. } => {
                        let _ = writeln!(output, "{role}: [Called tool: {tool} ({})]", state.status());
                    }
                }
            }
        }

        output
    }
}

impl Default for PlaceholderCompactor {
    fn default() -> Self {
        Self::from_config(&CompactionConfig::default())
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() > SUMMARY_LINE_CHARS {
        let prefix: String = text.chars().take(SUMMARY_LINE_CHARS).collect();
        format!("{prefix}... (truncated)")
    } else {
        text.to_string()
    }
}

#[async_trait]
impl ContextCompactor for PlaceholderCompactor {
    async fn compact_history(
        &self,
        session_id: &SessionId,
        messages: Vec<Message>,
    ) -> Result<CompactionResult> {
        let original_count = messages.len();
        let original_tokens = TokenEstimator::estimate_history(&messages);

        if messages.len() <= self.retain_recent {
            return Ok(CompactionResult {
                messages,
                original_count,
                new_count: original_count,
                original_tokens,
                new_tokens: original_tokens,
            });
        }

        let split_point = messages.len() - self.retain_recent;
        let (to_summarize, to_keep) = messages.split_at(split_point);

        let mut summary = Message::new(session_id.clone(), Role::System);
        summary.summary = true;
        summary.push_text(format!(
            "[Previous conversation summary: {} messages]\n\n{}",
            to_summarize.len(),
            Self::format_messages_for_summary(to_summarize)
        ));
        summary.complete();

        let mut new_messages = Vec::with_capacity(1 + to_keep.len());
        new_messages.push(summary);
        new_messages.extend(to_keep.iter().cloned());

        let new_count = new_messages.len();
        let new_tokens = TokenEstimator::estimate_history(&new_messages);

        Ok(CompactionResult {
            messages: new_messages,
            original_count,
            new_count,
            original_tokens,
            new_tokens,
        })
    }
}

/// Outcome of [`prune_tool_outputs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub parts: usize,
    pub tokens: u64,
}

/// Clear old completed tool outputs in place.
///
/// Walks back from the newest message, skipping the two most recent user
/// turns, and stops at a compaction summary or an already pruned output.
/// Outputs beyond the newest `prune_protect_tokens` are cleared, but only
/// when that frees more than `prune_minimum_tokens`.
pub fn prune_tool_outputs(messages: &mut [Message], config: &CompactionConfig) -> PruneResult {
    let mut total = 0u64;
    let mut pruned = 0u64;
    let mut targets = Vec::new();
    let mut turns = 0usize;

    'scan: for (msg_index, message) in messages.iter().enumerate().rev() {
        if message.role == Role::User {
            turns += 1;
        }
        if turns < 2 {
            continue;
        }
        if message.summary {
            break;
        }
        for (part_index, part) in message.parts.iter().enumerate().rev() {
            let PartKind::Tool {
                state: ToolState::Completed {
                    output, compacted, ..
                },
                ..
            } = &part.kind
            else {
                continue;
            };
            if *compacted {
                break 'scan;
            }
            let estimate = TokenEstimator::estimate_text(output);
            total += estimate;
            if total > config.prune_protect_tokens {
                pruned += estimate;
                targets.push((msg_index, part_index));
            }
        }
    }

    if pruned <= config.prune_minimum_tokens {
        return PruneResult::default();
    }

    for (msg_index, part_index) in &targets {
        if let PartKind::Tool {
            state: ToolState::Completed {
                output, compacted, ..
            },
            ..
        } = &mut messages[*msg_index].parts[*part_index].kind
        {
            *output = PRUNED_OUTPUT.to_string();
            *compacted = true;
        }
    }

    log::info!(
        "Pruned tool outputs (parts={}, tokens={pruned})",
        targets.len()
    );
    PruneResult {
        parts: targets.len(),
        tokens: pruned,
    }
}
