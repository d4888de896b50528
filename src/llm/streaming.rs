//! Streaming chunks and tool-call fragment accumulation.
//!
//! Providers yield [`StreamChunk`]s. Tool-call input may arrive in one piece
//! ([`StreamChunk::ToolCall`]) or as JSON fragments between
//! [`StreamChunk::ToolCallStart`] and [`StreamChunk::ToolCallEnd`];
//! [`ToolCallAccumulator`] turns either form into [`ToolCallRequest`]s.

use crate::error::ProviderError;
use crate::llm::StopReason;
use crate::types::TokenUsage;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;

/// One event of a streaming model response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),

    /// Start of a fragmented tool call (name and id are known).
    ToolCallStart { id: String, name: String },

    /// Partial JSON for a started tool call's input.
    ToolCallDelta { id: String, delta: String },

    ToolCallEnd { id: String },

    /// A tool call delivered whole.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },

    Usage(TokenUsage),

    Finish(StopReason),
}

/// Lazy, ordered, non-restartable model output.
pub type StreamBox = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// A completed tool call, ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool: String,
    pub input: Value,
    /// Set when fragmented input did not parse; such calls are not executed
    pub invalid: Option<String>,
}

#[derive(Debug)]
struct OpenCall {
    id: String,
    name: String,
    input_json: String,
}

/// Collects tool-call fragments for one streaming attempt.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    open: Vec<OpenCall>,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk. Returns a request when the chunk completes a tool call.
    pub fn apply(&mut self, chunk: &StreamChunk) -> Option<ToolCallRequest> {
        match chunk {
            StreamChunk::ToolCallStart { id, name } => {
                self.open.push(OpenCall {
                    id: id.clone(),
                    name: name.clone(),
                    input_json: String::new(),
                });
                None
            }
            StreamChunk::ToolCallDelta { id, delta } => {
                match self.open.iter_mut().find(|c| c.id == *id) {
                    Some(call) => call.input_json.push_str(delta),
                    None => log::warn!("Tool input fragment for unknown call (call_id={id})"),
                }
                None
            }
            StreamChunk::ToolCallEnd { id } => {
                let index = self.open.iter().position(|c| c.id == *id)?;
                Some(Self::close(self.open.remove(index)))
            }
            StreamChunk::ToolCall { id, name, input } => Some(ToolCallRequest {
                call_id: id.clone(),
                tool: name.clone(),
                input: input.clone(),
                invalid: None,
            }),
            StreamChunk::TextDelta(_)
            | StreamChunk::ReasoningDelta(_)
            | StreamChunk::Usage(_)
            | StreamChunk::Finish(_) => None,
        }
    }

    /// Close calls the stream never ended explicitly, in start order.
    pub fn finish(&mut self) -> Vec<ToolCallRequest> {
        self.open.drain(..).map(Self::close).collect()
    }

    #[must_use]
    pub fn has_open_calls(&self) -> bool {
        !self.open.is_empty()
    }

    fn close(call: OpenCall) -> ToolCallRequest {
        let raw = call.input_json.trim();
        let (input, invalid) = if raw.is_empty() {
            (Value::Object(serde_json::Map::new()), None)
        } else {
            match serde_json::from_str(raw) {
                Ok(input) => (input, None),
                Err(e) => (
                    Value::String(call.input_json.clone()),
                    Some(format!("Invalid tool input JSON: {e}")),
                ),
            }
        };
        ToolCallRequest {
            call_id: call.id,
            tool: call.name,
            input,
            invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start(id: &str, name: &str) -> StreamChunk {
        StreamChunk::ToolCallStart {
            id: id.into(),
            name: name.into(),
        }
    }

    fn delta(id: &str, delta: &str) -> StreamChunk {
        StreamChunk::ToolCallDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    fn end(id: &str) -> StreamChunk {
        StreamChunk::ToolCallEnd { id: id.into() }
    }

    #[test]
    fn test_fragments_assemble_into_request() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.apply(&start("call_1", "read")).is_none());
        assert!(acc.apply(&delta("call_1", r#"{"path":"#)).is_none());
        assert!(acc.apply(&delta("call_1", r#""a.txt"}"#)).is_none());

        let request = acc.apply(&end("call_1"));
        assert_eq!(
            request,
            Some(ToolCallRequest {
                call_id: "call_1".into(),
                tool: "read".into(),
                input: json!({"path": "a.txt"}),
                invalid: None,
            })
        );
        assert!(!acc.has_open_calls());
    }

    #[test]
    fn test_interleaved_calls_keep_their_own_input() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(&start("a", "read"));
        acc.apply(&start("b", "grep"));
        acc.apply(&delta("b", r#"{"q":"x"}"#));
        acc.apply(&delta("a", r#"{"path":"y"}"#));

        let b = acc.apply(&end("b"));
        let a = acc.apply(&end("a"));
        assert_eq!(b.map(|r| r.input), Some(json!({"q": "x"})));
        assert_eq!(a.map(|r| r.input), Some(json!({"path": "y"})));
    }

    #[test]
    fn test_whole_tool_call_passes_through() {
        let mut acc = ToolCallAccumulator::new();
        let request = acc.apply(&StreamChunk::ToolCall {
            id: "c".into(),
            name: "bash".into(),
            input: json!({"command": "ls"}),
        });
        assert_eq!(request.map(|r| r.tool), Some("bash".to_string()));
    }

    #[test]
    fn test_empty_input_is_empty_object() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(&start("c", "list"));
        let request = acc.apply(&end("c"));
        assert_eq!(request.map(|r| r.input), Some(json!({})));
    }

    #[test]
    fn test_invalid_json_is_flagged() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(&start("c", "read"));
        acc.apply(&delta("c", "invalid json {"));

        let request = acc.apply(&end("c"));
        let request = request.as_ref();
        assert!(request.is_some_and(|r| r.invalid.is_some()));
        assert_eq!(request.map(|r| r.input.clone()), Some(json!("invalid json {")));
    }

    #[test]
    fn test_finish_closes_unterminated_calls_in_order() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(&start("a", "read"));
        acc.apply(&delta("a", "{}"));
        acc.apply(&start("b", "write"));

        let closed = acc.finish();
        let ids: Vec<_> = closed.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn test_end_for_unknown_call_is_ignored() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.apply(&delta("ghost", "{}")).is_none());
        assert!(acc.apply(&end("ghost")).is_none());
        assert!(acc.apply(&StreamChunk::TextDelta("hi".into())).is_none());
    }
}
