use crate::message::Message;
use crate::types::SessionId;
use serde::{Deserialize, Serialize};

/// Input for one streaming call.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub session_id: SessionId,
    pub system: Option<String>,
    /// Full history, oldest first, including tool-call parts with their results
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// Tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}
