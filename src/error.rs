//! Error taxonomy for the runtime.
//!
//! Every failure the loop can observe is an [`AgentError`] variant, and every
//! variant maps to a stable [`ErrorCode`] so transports never need to parse
//! message text.

use crate::types::{RequestId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

/// Stable, machine-readable error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    PermissionDenied,
    PermissionRejected,
    PermissionCorrected,
    Interrupted,
    ToolFailed,
    UnknownTool,
    ProviderTransient,
    ProviderFatal,
    AlreadyResolved,
    SessionBusy,
    UnknownSession,
    DuplicateEventType,
    UnknownEventType,
    InvalidEventPayload,
    Storage,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::PermissionRejected => "permission_rejected",
            Self::PermissionCorrected => "permission_corrected",
            Self::Interrupted => "interrupted",
            Self::ToolFailed => "tool_failed",
            Self::UnknownTool => "unknown_tool",
            Self::ProviderTransient => "provider_transient",
            Self::ProviderFatal => "provider_fatal",
            Self::AlreadyResolved => "already_resolved",
            Self::SessionBusy => "session_busy",
            Self::UnknownSession => "unknown_session",
            Self::DuplicateEventType => "duplicate_event_type",
            Self::UnknownEventType => "unknown_event_type",
            Self::InvalidEventPayload => "invalid_event_payload",
            Self::Storage => "storage",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a provider failure is worth retrying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Network failures, rate limits, 5xx
    Transient,
    /// Authentication failures, malformed requests
    Fatal,
}

/// Failure reported by a model provider adapter.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// HTTP status, when the adapter has one
    pub status: Option<u16>,
    /// Delay requested by the server
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Classify an HTTP failure. 429 and 5xx are transient, everything else
    /// is fatal. `retry-after-ms` and `retry-after` headers (case-insensitive)
    /// are honoured.
    #[must_use]
    pub fn from_status(
        status: u16,
        message: impl Into<String>,
        headers: &HashMap<String, String>,
    ) -> Self {
        let kind = if status == 429 || (500..=599).contains(&status) {
            ProviderErrorKind::Transient
        } else {
            ProviderErrorKind::Fatal
        };
        Self {
            kind,
            message: message.into(),
            status: Some(status),
            retry_after: retry_after_from_headers(headers),
        }
    }

    #[must_use]
    pub const fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Transient)
    }

    /// Escalate an exhausted transient error.
    #[must_use]
    pub fn into_fatal(self, attempts: u32) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            message: format!("{} (after {attempts} attempts)", self.message),
            ..self
        }
    }
}

fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim())
    };

    if let Some(ms) = header("retry-after-ms").and_then(parse_non_negative) {
        return Some(Duration::from_millis(ms.ceil() as u64));
    }

    let value = header("retry-after")?;
    if let Some(seconds) = parse_non_negative(value) {
        return Some(Duration::from_millis((seconds * 1000.0).ceil() as u64));
    }

    let date = OffsetDateTime::parse(value, &Rfc2822).ok()?;
    let delta = date - OffsetDateTime::now_utc();
    if delta.is_positive() {
        Duration::try_from(delta).ok()
    } else {
        None
    }
}

fn parse_non_negative(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// Errors surfaced by the runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(
        "The user has specified a rule which prevents you from using this specific tool call. Relevant rules: {rules}"
    )]
    Denied {
        permission: String,
        pattern: String,
        rules: String,
    },

    #[error("The user rejected permission to use this specific tool call.")]
    Rejected,

    #[error(
        "The user rejected permission to use this specific tool call with the following feedback: {feedback}"
    )]
    Corrected { feedback: String },

    #[error("Session {session_id} was interrupted")]
    Interrupted { session_id: SessionId },

    #[error("{message}")]
    Tool { tool: String, message: String },

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Permission request {request_id} is not pending (already resolved)")]
    AlreadyResolved { request_id: RequestId },

    #[error("Session {session_id} is busy")]
    SessionBusy { session_id: SessionId },

    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: SessionId },

    #[error("Event type {event_type} is already defined with a different schema")]
    DuplicateType { event_type: String },

    #[error("Event type {event_type} is not defined")]
    UnknownEventType { event_type: String },

    #[error("Invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AgentError {
    #[must_use]
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Denied { .. } => ErrorCode::PermissionDenied,
            Self::Rejected => ErrorCode::PermissionRejected,
            Self::Corrected { .. } => ErrorCode::PermissionCorrected,
            Self::Interrupted { .. } => ErrorCode::Interrupted,
            Self::Tool { .. } => ErrorCode::ToolFailed,
            Self::UnknownTool { .. } => ErrorCode::UnknownTool,
            Self::Provider(e) => match e.kind {
                ProviderErrorKind::Transient => ErrorCode::ProviderTransient,
                ProviderErrorKind::Fatal => ErrorCode::ProviderFatal,
            },
            Self::AlreadyResolved { .. } => ErrorCode::AlreadyResolved,
            Self::SessionBusy { .. } => ErrorCode::SessionBusy,
            Self::UnknownSession { .. } => ErrorCode::UnknownSession,
            Self::DuplicateType { .. } => ErrorCode::DuplicateEventType,
            Self::UnknownEventType { .. } => ErrorCode::UnknownEventType,
            Self::InvalidPayload { .. } => ErrorCode::InvalidEventPayload,
            Self::Storage(_) => ErrorCode::Storage,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Errors that become tool-result content instead of ending the loop.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Denied { .. }
                | Self::Rejected
                | Self::Corrected { .. }
                | Self::Tool { .. }
                | Self::UnknownTool { .. }
        )
    }

    /// Permission outcomes that stop the loop unless `continue_loop_on_deny` is set.
    #[must_use]
    pub const fn blocks_turn(&self) -> bool {
        matches!(
            self,
            Self::Denied { .. } | Self::Rejected | Self::Corrected { .. }
        )
    }

    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
