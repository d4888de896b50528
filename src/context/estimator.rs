//! Token estimation for context size calculation.

use crate::message::{Message, Part, PartKind, ToolState};

/// Estimates token count for messages.
///
/// Uses a simple heuristic of ~4 characters per token. Providers report
/// exact usage after each turn; this is for history that has not been
/// sent yet and for pruning decisions.
pub struct TokenEstimator;

impl TokenEstimator {
    const CHARS_PER_TOKEN: usize = 4;

    /// Overhead tokens per message (role, formatting).
    const MESSAGE_OVERHEAD: u64 = 4;

    /// Overhead for a tool call and its result (id, name, formatting).
    const TOOL_OVERHEAD: u64 = 20;

    #[must_use]
    pub const fn estimate_text(text: &str) -> u64 {
        text.len().div_ceil(Self::CHARS_PER_TOKEN) as u64
    }

    #[must_use]
    pub fn estimate_part(part: &Part) -> u64 {
        match &part.kind {
            PartKind::Text { text } | PartKind::Reasoning { text } => Self::estimate_text(text),
            PartKind::Tool {
                tool, input, state, ..
            } => {
                let input_str = serde_json::to_string(input).unwrap_or_default();
                let result = match state {
                    ToolState::Completed { output, .. } => Self::estimate_text(output),
                    ToolState::Error { error, .. } => Self::estimate_text(error),
                    ToolState::Pending | ToolState::Running => 0,
                };
                Self::estimate_text(tool)
                    + Self::estimate_text(&input_str)
                    + result
                    + Self::TOOL_OVERHEAD
            }
        }
    }

    #[must_use]
    pub fn estimate_message(message: &Message) -> u64 {
        message.parts.iter().map(Self::estimate_part).sum::<u64>() + Self::MESSAGE_OVERHEAD
    }

    #[must_use]
    pub fn estimate_history(messages: &[Message]) -> u64 {
        messages.iter().map(Self::estimate_message).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;
    use serde_json::{Value, json};

    #[test]
    fn test_estimate_text() {
        assert_eq!(TokenEstimator::estimate_text(""), 0);
        assert_eq!(TokenEstimator::estimate_text("hi"), 1);
        assert_eq!(TokenEstimator::estimate_text("test"), 1);
        assert_eq!(TokenEstimator::estimate_text("hello"), 2);
        assert_eq!(TokenEstimator::estimate_text("hello world!"), 3);
    }

    #[test]
    fn test_estimate_text_message() {
        // 19 chars = 5 tokens, plus 4 overhead
        let message = Message::user(SessionId::new(), "Hello, how are you?");
        assert_eq!(TokenEstimator::estimate_message(&message), 9);
    }

    #[test]
    fn test_estimate_tool_part_counts_output() {
        let mut message = Message::assistant(SessionId::new());
        message.push(PartKind::Tool {
            call_id: "c".into(),
            tool: "read".into(),
            input: json!({}),
            state: ToolState::Completed {
                output: "File contents here...".into(),
                title: String::new(),
                metadata: Value::Null,
                compacted: false,
            },
        });
        // name 1 + input "{}" 1 + output 6 + overhead 20 + message 4
        assert_eq!(TokenEstimator::estimate_message(&message), 32);
    }

    #[test]
    fn test_estimate_history() {
        let session = SessionId::new();
        let messages = vec![
            Message::user(session.clone(), "Hello"),
            Message::user(session.clone(), "Hi there!"),
            Message::user(session, "How are you?"),
        ];
        assert_eq!(TokenEstimator::estimate_history(&messages), 20);
        assert_eq!(TokenEstimator::estimate_history(&[]), 0);
    }
}
