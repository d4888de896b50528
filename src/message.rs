//! Messages and parts.
//!
//! A [`Message`] belongs to one session and holds an ordered list of
//! [`Part`]s. Parts are appended and then updated in place while a turn
//! streams; tool-call parts move through [`ToolState`] monotonically.

use crate::types::{MessageId, PartId, SessionId, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub usage: TokenUsage,
    /// Set on messages produced by compaction
    #[serde(default)]
    pub summary: bool,
}

impl Message {
    #[must_use]
    pub fn new(session_id: SessionId, role: Role) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            role,
            parts: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
            usage: TokenUsage::default(),
            summary: false,
        }
    }

    /// A completed user message with a single text part.
    #[must_use]
    pub fn user(session_id: SessionId, text: impl Into<String>) -> Self {
        let mut message = Self::new(session_id, Role::User);
        message.push_text(text);
        message.completed_at = Some(message.created_at);
        message
    }

    #[must_use]
    pub fn assistant(session_id: SessionId) -> Self {
        Self::new(session_id, Role::Assistant)
    }

    /// Append a text part and return its id.
    pub fn push_text(&mut self, text: impl Into<String>) -> PartId {
        self.push(PartKind::Text { text: text.into() })
    }

    /// Append a part and return its id.
    pub fn push(&mut self, kind: PartKind) -> PartId {
        let part = Part {
            id: PartId::new(),
            message_id: self.id.clone(),
            session_id: self.session_id.clone(),
            kind,
        };
        let id = part.id.clone();
        self.parts.push(part);
        id
    }

    #[must_use]
    pub fn part(&self, id: &PartId) -> Option<&Part> {
        self.parts.iter().find(|p| &p.id == id)
    }

    pub fn part_mut(&mut self, id: &PartId) -> Option<&mut Part> {
        self.parts.iter_mut().find(|p| &p.id == id)
    }

    /// Concatenated text of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match &p.kind {
                PartKind::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool-call parts in emission order.
    pub fn tool_parts(&self) -> impl Iterator<Item = &Part> {
        self.parts
            .iter()
            .filter(|p| matches!(p.kind, PartKind::Tool { .. }))
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(OffsetDateTime::now_utc());
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Part {
    pub id: PartId,
    pub message_id: MessageId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: PartKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartKind {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Tool {
        call_id: String,
        tool: String,
        input: Value,
        state: ToolState,
    },
}

/// Status of a tool-call part.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Running,
    Completed {
        output: String,
        title: String,
        #[serde(default)]
        metadata: Value,
        /// Output was cleared by pruning
        #[serde(default)]
        compacted: bool,
    },
    Error {
        error: String,
        code: crate::error::ErrorCode,
    },
}

impl ToolState {
    const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed { .. } | Self::Error { .. } => 2,
        }
    }

    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.rank() == 2
    }

    /// Move to `next` if that is a forward transition. Returns whether the
    /// state changed; finished states never change again.
    pub fn advance(&mut self, next: Self) -> bool {
        if next.rank() <= self.rank() {
            log::warn!(
                "Ignoring tool state regression (from={}, to={})",
                self.status(),
                next.status()
            );
            return false;
        }
        *self = next;
        true
    }
}
