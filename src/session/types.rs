use crate::bus::{EventBus, Scope};
use crate::error::ProviderError;
use crate::events::SessionStatusChanged;
use crate::llm::ToolDefinition;
use crate::message::Message;
use crate::permission::Ruleset;
use crate::types::{MessageId, SessionId, SessionInfo, SessionStatus, TokenUsage};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Why a prompt loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    /// The model answered without calling tools
    Completed,
    /// The turn ceiling was reached while the model still wanted tools
    MaxTurns,
    /// A tool call was denied or rejected and the loop does not continue on deny
    Blocked,
    Interrupted,
}

/// Result of [`SessionPrompt::prompt`](super::SessionPrompt::prompt).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromptOutcome {
    pub session_id: SessionId,
    /// Final assistant message, if a turn ran
    pub message_id: Option<MessageId>,
    pub stop: StopKind,
    pub turns: usize,
    pub usage: TokenUsage,
    /// Text of the final assistant message
    pub text: String,
}

/// What one processed turn produced.
#[derive(Debug)]
pub(crate) struct ProcessorResult {
    /// Completed assistant message, tool parts in finished states
    pub(crate) message: Message,
    pub(crate) tool_calls: usize,
    pub(crate) blocked: bool,
    pub(crate) interrupted: bool,
    pub(crate) usage: TokenUsage,
}

/// Borrowed input for a single turn.
pub(crate) struct TurnInput<'a> {
    pub(crate) entry: &'a SessionEntry,
    pub(crate) history: Vec<Message>,
    pub(crate) tools: &'a [ToolDefinition],
    pub(crate) system: Option<&'a str>,
    pub(crate) rules: &'a Ruleset,
    pub(crate) cancel: &'a CancellationToken,
}

/// A streaming attempt that ended with a provider error.
#[derive(Debug)]
pub(crate) struct AttemptFailure {
    pub(crate) error: ProviderError,
    /// Output already reached observers before the failure
    pub(crate) partial: bool,
}

#[derive(Debug)]
pub(crate) enum RetryError {
    /// Fatal, or transient with attempts exhausted
    Fatal(ProviderError),
    /// Transient after partial output; the caller decides whether to re-issue
    Partial(ProviderError),
    Interrupted,
}

/// Per-session runtime state owned by the prompt orchestrator.
pub(crate) struct SessionEntry {
    info: Mutex<SessionInfo>,
    /// Execution slot; held for the whole prompt loop
    pub(crate) slot: Arc<tokio::sync::Mutex<()>>,
    cancel: Mutex<CancellationToken>,
}

impl SessionEntry {
    pub(crate) fn new(info: SessionInfo) -> Self {
        Self {
            info: Mutex::new(info),
            slot: Arc::new(tokio::sync::Mutex::new(())),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn id(&self) -> SessionId {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).id.clone()
    }

    pub(crate) fn project_id(&self) -> String {
        self.info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .project_id
            .clone()
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.info.lock().unwrap_or_else(PoisonError::into_inner).status
    }

    /// Record and publish a status change. Repeated statuses are not republished.
    pub(crate) fn set_status(&self, bus: &EventBus, status: SessionStatus) {
        let session_id = {
            let mut info = self.info.lock().unwrap_or_else(PoisonError::into_inner);
            if info.status == status {
                return;
            }
            info.status = status;
            info.updated_at = OffsetDateTime::now_utc();
            info.id.clone()
        };
        let event = SessionStatusChanged {
            session_id: session_id.clone(),
            status,
        };
        if let Err(e) = bus.publish_event(&event, &Scope::session(&session_id)) {
            log::warn!("Failed to publish session status (session_id={session_id}, error={e})");
        }
    }

    /// Fresh token for a new prompt loop.
    pub(crate) fn reset_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    pub(crate) fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot.try_lock().is_err()
    }
}
