//! Runtime events published on the [`EventBus`](crate::bus::EventBus).
//!
//! Each event is a typed payload implementing [`BusEvent`]; observers receive
//! it inside an [`EventEnvelope`](crate::bus::EventEnvelope) and can decode it
//! back with [`EventEnvelope::decode`](crate::bus::EventEnvelope::decode).
//!
//! # Event Flow
//!
//! A typical prompt produces:
//! 1. `message.updated` - user message persisted
//! 2. `session.status` (`streaming`)
//! 3. `message.part.updated` / `message.part.delta` - assistant output
//! 4. `permission.asked` / `permission.replied` - human-in-the-loop gates
//! 5. `session.status` (`tool-executing`), `tool.completed` / `tool.error`
//! 6. `session.status` (`done` or `interrupted`) - terminal

use crate::bus::BusEvent;
use crate::error::ErrorCode;
use crate::message::{Part, Role};
use crate::permission::{AskReason, PermissionReply};
use crate::types::{MessageId, PartId, RequestId, SessionId, SessionStatus, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

fn object_schema(required: &[&str]) -> Value {
    json!({ "type": "object", "required": required })
}

/// Session lifecycle change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusChanged {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

impl BusEvent for SessionStatusChanged {
    const TYPE: &'static str = "session.status";

    fn schema() -> Value {
        object_schema(&["session_id", "status"])
    }
}

/// A message was created or its metadata changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdated {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub role: Role,
    pub completed: bool,
    pub usage: TokenUsage,
}

impl BusEvent for MessageUpdated {
    const TYPE: &'static str = "message.updated";

    fn schema() -> Value {
        object_schema(&["session_id", "message_id", "role"])
    }
}

/// A part was appended or its state changed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartUpdated {
    pub session_id: SessionId,
    pub part: Part,
}

impl BusEvent for PartUpdated {
    const TYPE: &'static str = "message.part.updated";

    fn schema() -> Value {
        object_schema(&["session_id", "part"])
    }
}

/// Incremental text appended to a part's `field`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartDelta {
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub part_id: PartId,
    pub field: String,
    pub delta: String,
}

impl BusEvent for PartDelta {
    const TYPE: &'static str = "message.part.delta";

    fn schema() -> Value {
        object_schema(&["session_id", "message_id", "part_id", "field", "delta"])
    }
}

/// A tool call is waiting for a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionAsked {
    pub id: RequestId,
    pub session_id: SessionId,
    pub permission: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<AskReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl BusEvent for PermissionAsked {
    const TYPE: &'static str = "permission.asked";

    fn schema() -> Value {
        object_schema(&["id", "session_id", "permission", "pattern"])
    }
}

/// A pending permission request was resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionReplied {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub reply: PermissionReply,
}

impl BusEvent for PermissionReplied {
    const TYPE: &'static str = "permission.replied";

    fn schema() -> Value {
        object_schema(&["session_id", "request_id", "reply"])
    }
}

/// A tool finished successfully.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCompleted {
    pub session_id: SessionId,
    pub call_id: String,
    pub tool: String,
    pub title: String,
    pub duration_ms: u64,
}

impl BusEvent for ToolCompleted {
    const TYPE: &'static str = "tool.completed";

    fn schema() -> Value {
        object_schema(&["session_id", "call_id", "tool"])
    }
}

/// A tool call failed, was denied, or was rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolFailed {
    pub session_id: SessionId,
    pub call_id: String,
    pub tool: String,
    pub error: String,
    pub code: ErrorCode,
}

impl BusEvent for ToolFailed {
    const TYPE: &'static str = "tool.error";

    fn schema() -> Value {
        object_schema(&["session_id", "call_id", "tool", "error", "code"])
    }
}

/// History was compacted after a context overflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionCompacted {
    pub session_id: SessionId,
    pub messages_before: usize,
    pub messages_after: usize,
}

impl BusEvent for SessionCompacted {
    const TYPE: &'static str = "session.compacted";

    fn schema() -> Value {
        object_schema(&["session_id"])
    }
}

/// Definitions installed by [`EventBus::with_builtin_events`](crate::bus::EventBus::with_builtin_events).
pub(crate) fn builtin_definitions() -> Vec<(&'static str, Value)> {
    vec![
        (SessionStatusChanged::TYPE, SessionStatusChanged::schema()),
        (MessageUpdated::TYPE, MessageUpdated::schema()),
        (PartUpdated::TYPE, PartUpdated::schema()),
        (PartDelta::TYPE, PartDelta::schema()),
        (PermissionAsked::TYPE, PermissionAsked::schema()),
        (PermissionReplied::TYPE, PermissionReplied::schema()),
        (ToolCompleted::TYPE, ToolCompleted::schema()),
        (ToolFailed::TYPE, ToolFailed::schema()),
        (SessionCompacted::TYPE, SessionCompacted::schema()),
    ]
}
