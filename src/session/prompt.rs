use super::builder::SessionPromptBuilder;
use super::processor::SessionProcessor;
use super::retry::RetryPolicy;
use super::tool_execution::ToolExecutor;
use super::types::{PromptOutcome, SessionEntry, StopKind, TurnInput};
use crate::bus::{EventBus, Scope};
use crate::context::{ContextCompactor, PruneResult, TokenEstimator, prune_tool_outputs};
use crate::doom_loop::DoomLoopDetector;
use crate::error::AgentError;
use crate::events::{MessageUpdated, SessionCompacted, SessionStatusChanged};
use crate::llm::LlmProvider;
use crate::message::Message;
use crate::permission::{PermissionGuard, Ruleset};
use crate::stores::MessageStore;
use crate::tools::ToolRegistry;
use crate::types::{AgentConfig, SessionId, SessionInfo, SessionStatus, TokenUsage};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Drives sessions: one prompt loop per session at a time, any number of
/// sessions in parallel.
///
/// Each [`prompt`](Self::prompt) persists the user message, then runs turns
/// until the model stops calling tools, the turn ceiling is hit, a tool call
/// is blocked, the session is interrupted, or a fatal error surfaces.
/// Afterwards old tool outputs are pruned, history is compacted on overflow,
/// and a terminal `session.status` is published.
pub struct SessionPrompt {
    pub(super) provider: Arc<dyn LlmProvider>,
    pub(super) tools: Arc<ToolRegistry>,
    pub(super) bus: Arc<EventBus>,
    pub(super) messages: Arc<dyn MessageStore>,
    pub(super) compactor: Arc<dyn ContextCompactor>,
    pub(super) guard: Arc<PermissionGuard>,
    pub(super) doom: Arc<DoomLoopDetector>,
    pub(super) executor: ToolExecutor,
    /// Agent defaults merged with user rules
    pub(super) rules: Ruleset,
    pub(super) config: AgentConfig,
    pub(super) sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
}

impl std::fmt::Debug for SessionPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPrompt")
            .field("provider", &self.provider.provider())
            .field("model", &self.provider.model())
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionPrompt {
    #[must_use]
    pub fn builder(provider: Arc<dyn LlmProvider>) -> SessionPromptBuilder {
        SessionPromptBuilder::new(provider)
    }

    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The permission gate; UIs answer `permission.asked` through it.
    #[must_use]
    pub const fn guard(&self) -> &Arc<PermissionGuard> {
        &self.guard
    }

    #[must_use]
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Register a new idle session.
    pub fn create_session(&self, project_id: impl Into<String>) -> SessionInfo {
        let info = SessionInfo::new(project_id);
        let entry = Arc::new(SessionEntry::new(info.clone()));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.id.clone(), entry);

        let event = SessionStatusChanged {
            session_id: info.id.clone(),
            status: info.status,
        };
        if let Err(e) = self.bus.publish_event(&event, &Scope::session(&info.id)) {
            warn!("Failed to publish session status (session_id={}, error={e})", info.id);
        }
        info!("Session created (session_id={}, project_id={})", info.id, info.project_id);
        info
    }

    /// Snapshot of a session.
    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.entry(session_id).map(|entry| entry.info())
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| entry.info())
            .collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    #[must_use]
    pub fn status(&self, session_id: &SessionId) -> Option<SessionStatus> {
        self.entry(session_id).map(|entry| entry.status())
    }

    /// Stored history of a session.
    ///
    /// # Errors
    /// `UnknownSession`, or `Storage` when the message store fails.
    pub async fn history(&self, session_id: &SessionId) -> Result<Vec<Message>, AgentError> {
        self.require(session_id)?;
        self.messages
            .history(session_id)
            .await
            .map_err(AgentError::Storage)
    }

    /// Ask a running prompt loop to stop at its next suspension point.
    ///
    /// Pending permission requests of the session are force-rejected.
    /// Returns whether a loop was running.
    pub fn interrupt(&self, session_id: &SessionId) -> bool {
        let Some(entry) = self.entry(session_id) else {
            return false;
        };
        let running = entry.is_running();
        entry.cancel();
        let rejected = self.guard.cancel_session(session_id);
        info!("Session interrupted (session_id={session_id}, running={running}, rejected={rejected})");
        running
    }

    /// Interrupt and forget a session, releasing its cached approvals and
    /// doom-loop window. Stored history is left to the message store.
    pub fn remove_session(&self, session_id: &SessionId) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let Some(entry) = removed else {
            return false;
        };
        entry.cancel();
        self.guard.clear_session(session_id);
        self.doom.clear_session(session_id);
        debug!("Session removed (session_id={session_id})");
        true
    }

    /// Interrupt every session and reject all pending permission requests.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for entry in entries {
            entry.cancel();
        }
        self.guard.shutdown().await;
    }

    /// Run the prompt loop for one user message.
    ///
    /// # Errors
    /// - `UnknownSession` / `SessionBusy` before anything runs
    /// - `Provider` when the model fails fatally (the session returns to idle)
    /// - `Storage` when history cannot be read or written
    pub async fn prompt(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
    ) -> Result<PromptOutcome, AgentError> {
        let entry = self.require(session_id)?;
        let Ok(_slot) = Arc::clone(&entry.slot).try_lock_owned() else {
            warn!("Prompt rejected, session is busy (session_id={session_id})");
            return Err(AgentError::SessionBusy {
                session_id: session_id.clone(),
            });
        };
        let cancel = entry.reset_cancel();

        let mut user = Message::user(session_id.clone(), text);
        user.complete();
        self.save(&user).await?;
        self.publish_message(&user);

        info!("Prompt started (session_id={session_id}, max_turns={})", self.config.max_turns);
        match self.run_loop(&entry, &cancel).await {
            Ok(outcome) => {
                let status = if outcome.stop == StopKind::Interrupted {
                    SessionStatus::Interrupted
                } else {
                    SessionStatus::Done
                };
                entry.set_status(&self.bus, status);
                info!(
                    "Prompt finished (session_id={session_id}, stop={:?}, turns={}, total_tokens={})",
                    outcome.stop,
                    outcome.turns,
                    outcome.usage.total()
                );
                Ok(outcome)
            }
            Err(e) => {
                error!("Prompt failed (session_id={session_id}, code={}, error={e})", e.code().as_str());
                entry.set_status(&self.bus, SessionStatus::Idle);
                Err(e)
            }
        }
    }

    async fn run_loop(
        &self,
        entry: &SessionEntry,
        cancel: &CancellationToken,
    ) -> Result<PromptOutcome, AgentError> {
        let session_id = entry.id();
        let hidden = PermissionGuard::disabled_tools(&self.rules, self.tools.permissions());
        if !hidden.is_empty() {
            debug!("Tools hidden by rules (session_id={session_id}, tools={hidden:?})");
        }
        let definitions = self.tools.definitions(&hidden);

        let processor = SessionProcessor {
            provider: self.provider.as_ref(),
            executor: &self.executor,
            bus: &self.bus,
            retry: RetryPolicy::new(self.config.retry.clone()),
            turn_retries: self.config.turn_retries,
            continue_loop_on_deny: self.config.continue_loop_on_deny,
        };

        let mut turns = 0usize;
        let mut usage = TokenUsage::default();
        let mut last: Option<Message> = None;

        let stop = loop {
            if cancel.is_cancelled() {
                break StopKind::Interrupted;
            }
            turns += 1;
            entry.set_status(&self.bus, SessionStatus::Streaming);

            let history = self
                .messages
                .history(&session_id)
                .await
                .map_err(AgentError::Storage)?;
            debug!(
                "Turn started (session_id={session_id}, turn={turns}, history_len={})",
                history.len()
            );

            let result = processor
                .process(TurnInput {
                    entry,
                    history,
                    tools: &definitions,
                    system: self.config.system_prompt.as_deref(),
                    rules: &self.rules,
                    cancel,
                })
                .await?;
            usage.add(&result.usage);

            let stop = if result.interrupted {
                Some(StopKind::Interrupted)
            } else if result.blocked {
                Some(StopKind::Blocked)
            } else if result.tool_calls == 0 {
                Some(StopKind::Completed)
            } else if turns >= self.config.max_turns {
                warn!("Max turns reached (session_id={session_id}, max_turns={})", self.config.max_turns);
                Some(StopKind::MaxTurns)
            } else {
                None
            };

            if let Some(stop) = stop {
                last = Some(result.message);
                break stop;
            }
            self.save(&result.message).await?;
            last = Some(result.message);
        };

        let final_message = last;
        self.finish(&session_id, final_message.as_ref()).await?;

        Ok(PromptOutcome {
            session_id,
            message_id: final_message.as_ref().map(|m| m.id.clone()),
            stop,
            turns,
            usage,
            text: final_message.map(|m| m.text()).unwrap_or_default(),
        })
    }

    /// Prune, compact on overflow, then persist the final message.
    async fn finish(&self, session_id: &SessionId, last: Option<&Message>) -> Result<(), AgentError> {
        let config = &self.config.compaction;
        let mut history = self
            .messages
            .history(session_id)
            .await
            .map_err(AgentError::Storage)?;
        if let Some(message) = last {
            match history.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => existing.clone_from(message),
                None => history.push(message.clone()),
            }
        }

        let pruned = if config.prune {
            prune_tool_outputs(&mut history, config)
        } else {
            PruneResult::default()
        };

        let reported = last.map_or(0, |m| {
            m.usage.input_tokens + m.usage.output_tokens + m.usage.cache_read_tokens
        });
        let tokens = TokenEstimator::estimate_history(&history).max(reported);

        if config.auto_compact && config.is_overflow(tokens) {
            info!("Context overflow, compacting (session_id={session_id}, tokens={tokens}, messages={})", history.len());
            match self.compactor.compact_history(session_id, history.clone()).await {
                Ok(result) => {
                    self.replace(session_id, result.messages).await?;
                    let event = SessionCompacted {
                        session_id: session_id.clone(),
                        messages_before: result.original_count,
                        messages_after: result.new_count,
                    };
                    if let Err(e) = self.bus.publish_event(&event, &Scope::session(session_id)) {
                        warn!("Failed to publish compaction (session_id={session_id}, error={e})");
                    }
                    info!(
                        "Compacted history (session_id={session_id}, messages_before={}, messages_after={}, tokens_before={}, tokens_after={})",
                        result.original_count,
                        result.new_count,
                        result.original_tokens,
                        result.new_tokens
                    );
                    return Ok(());
                }
                Err(e) => warn!("Compaction failed, keeping history (session_id={session_id}, error={e:#})"),
            }
        }

        if pruned.parts > 0 {
            self.replace(session_id, history).await
        } else if let Some(message) = last {
            self.save(message).await
        } else {
            Ok(())
        }
    }

    fn entry(&self, session_id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn require(&self, session_id: &SessionId) -> Result<Arc<SessionEntry>, AgentError> {
        self.entry(session_id).ok_or_else(|| AgentError::UnknownSession {
            session_id: session_id.clone(),
        })
    }

    async fn save(&self, message: &Message) -> Result<(), AgentError> {
        self.messages
            .save_message(message)
            .await
            .map_err(AgentError::Storage)
    }

    async fn replace(&self, session_id: &SessionId, messages: Vec<Message>) -> Result<(), AgentError> {
        self.messages
            .replace_history(session_id, messages)
            .await
            .map_err(AgentError::Storage)
    }

    fn publish_message(&self, message: &Message) {
        let event = MessageUpdated {
            session_id: message.session_id.clone(),
            message_id: message.id.clone(),
            role: message.role,
            completed: message.completed_at.is_some(),
            usage: message.usage,
        };
        if let Err(e) = self.bus.publish_event(&event, &Scope::session(&message.session_id)) {
            warn!("Failed to publish message (message_id={}, error={e})", message.id);
        }
    }
}
