//! Human-in-the-loop permission gate.
//!
//! [`PermissionGuard`] evaluates [`Ruleset`]s, suspends tool calls that need
//! a human decision, and remembers "always" approvals at the configured
//! [`MemoryScope`].
//!
//! A request is a rendezvous between the task executing the tool call (which
//! awaits [`PermissionGuard::request`]) and whoever answers it through
//! [`PermissionGuard::reply`]. Each request resolves exactly once; replying
//! to a request that is no longer pending fails with
//! [`AgentError::AlreadyResolved`].
//!
//! Cascades:
//! - `always` also resolves other pending requests the new approval covers.
//! - `reject` rejects every other pending request of the same session.

mod rules;

pub use rules::{Effect, PermissionRule, Ruleset, expand_home, wildcard_match};

use crate::bus::{EventBus, Scope};
use crate::error::AgentError;
use crate::events::{PermissionAsked, PermissionReplied};
use crate::stores::Storage;
use crate::types::{RequestId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const APPROVAL_KEY: &str = "permission_approval";

/// Where an "always" reply is remembered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    /// Not remembered beyond the current request
    Turn,
    /// Remembered in memory for the session
    #[default]
    Session,
    /// Remembered in memory for every session of the project
    Project,
    /// Like `Project`, and written to storage
    Persisted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

/// Why a request is being asked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskReason {
    /// The merged rules evaluated to `ask`
    #[default]
    Rule,
    /// The same call repeated too often; asked even when rules allow it
    DoomLoop,
}

/// Parameters of a permission request.
#[derive(Clone, Debug)]
pub struct PermissionAsk {
    pub session_id: SessionId,
    pub project_id: String,
    pub permission: String,
    pub pattern: String,
    pub reason: AskReason,
    pub call_id: Option<String>,
    pub metadata: Value,
}

/// A request waiting for a reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: RequestId,
    pub session_id: SessionId,
    pub project_id: String,
    pub permission: String,
    pub pattern: String,
    pub reason: AskReason,
    pub call_id: Option<String>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug)]
enum Resolution {
    Approved,
    Rejected { feedback: Option<String> },
    Interrupted,
}

struct Pending {
    request: PermissionRequest,
    scope: MemoryScope,
    slot: oneshot::Sender<Resolution>,
}

impl Pending {
    fn resolve(self, resolution: Resolution) {
        // The waiter may already be gone after an interrupt
        let _ = self.slot.send(resolution);
    }

    fn shares_memory_with(&self, other: &PermissionRequest, scope: MemoryScope) -> bool {
        match scope {
            MemoryScope::Turn | MemoryScope::Session => {
                self.request.session_id == other.session_id
            }
            MemoryScope::Project | MemoryScope::Persisted => {
                self.request.project_id == other.project_id
            }
        }
    }
}

/// Rule evaluation plus blocking-wait coordination for permission prompts.
pub struct PermissionGuard {
    bus: Arc<EventBus>,
    storage: Arc<dyn Storage>,
    scope: MemoryScope,
    pending: Mutex<Vec<Pending>>,
    session_approvals: RwLock<HashMap<SessionId, Ruleset>>,
    project_approvals: RwLock<HashMap<String, Ruleset>>,
    persisted_loaded: tokio::sync::Mutex<HashSet<String>>,
}

impl std::fmt::Debug for PermissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGuard")
            .field("scope", &self.scope)
            .field("pending", &self.lock_pending().len())
            .finish_non_exhaustive()
    }
}

impl PermissionGuard {
    #[must_use]
    pub fn new(bus: Arc<EventBus>, storage: Arc<dyn Storage>, scope: MemoryScope) -> Self {
        Self {
            bus,
            storage,
            scope,
            pending: Mutex::new(Vec::new()),
            session_approvals: RwLock::new(HashMap::new()),
            project_approvals: RwLock::new(HashMap::new()),
            persisted_loaded: tokio::sync::Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn scope(&self) -> MemoryScope {
        self.scope
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Effect of the last matching rule; `Ask` when nothing matches.
    #[must_use]
    pub fn evaluate(rules: &Ruleset, permission: &str, pattern: &str) -> Effect {
        rules.evaluate(permission, pattern)
    }

    /// Tools to hide from the model: those `rules` deny for every pattern.
    #[must_use]
    pub fn disabled_tools<'a>(
        rules: &Ruleset,
        tools: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> HashSet<String> {
        rules.disabled_tools(tools)
    }

    /// Approvals remembered for this session/project under the configured scope.
    pub async fn remembered(&self, session_id: &SessionId, project_id: &str) -> Ruleset {
        self.remembered_in(self.scope, session_id, project_id).await
    }

    async fn remembered_in(
        &self,
        scope: MemoryScope,
        session_id: &SessionId,
        project_id: &str,
    ) -> Ruleset {
        match scope {
            MemoryScope::Turn => Ruleset::new(),
            MemoryScope::Session => self
                .session_approvals
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(session_id)
                .cloned()
                .unwrap_or_default(),
            MemoryScope::Project | MemoryScope::Persisted => {
                if scope == MemoryScope::Persisted {
                    self.ensure_persisted_loaded(project_id).await;
                }
                self.project_approvals
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(project_id)
                    .cloned()
                    .unwrap_or_default()
            }
        }
    }

    /// Evaluate `rules` merged with remembered approvals (last match wins).
    pub async fn check(
        &self,
        rules: &Ruleset,
        session_id: &SessionId,
        project_id: &str,
        permission: &str,
        pattern: &str,
    ) -> Effect {
        let remembered = self.remembered(session_id, project_id).await;
        let merged = Ruleset::merge(&[rules, &remembered]);
        let effect = merged.evaluate(permission, pattern);
        log::debug!(
            "Evaluated permission (permission={permission}, pattern={pattern}, rule_count={}, effect={effect:?})",
            merged.len()
        );
        effect
    }

    /// Ask for a human decision and wait for it.
    ///
    /// Publishes `permission.asked` and suspends until [`reply`](Self::reply)
    /// resolves the request or `cancel` fires. There is no timeout.
    ///
    /// # Errors
    /// - `Rejected` / `Corrected` when the user declines
    /// - `Interrupted` when the session is interrupted while waiting
    pub async fn request(
        &self,
        ask: PermissionAsk,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let (slot, waiter) = oneshot::channel();
        let request = PermissionRequest {
            id: RequestId::new(),
            session_id: ask.session_id,
            project_id: ask.project_id,
            permission: ask.permission,
            pattern: ask.pattern,
            reason: ask.reason,
            call_id: ask.call_id,
            metadata: ask.metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        let request_id = request.id.clone();
        let session_id = request.session_id.clone();
        let scope = Scope::session(&session_id);

        let asked = PermissionAsked {
            id: request.id.clone(),
            session_id: request.session_id.clone(),
            permission: request.permission.clone(),
            pattern: request.pattern.clone(),
            reason: Some(request.reason),
            call_id: request.call_id.clone(),
            metadata: request.metadata.clone(),
        };

        self.lock_pending().push(Pending {
            request,
            scope: self.scope,
            slot,
        });

        log::info!(
            "Permission asked (request_id={request_id}, session_id={session_id}, permission={}, pattern={}, reason={:?})",
            asked.permission,
            asked.pattern,
            asked.reason
        );
        if let Err(e) = self.bus.publish_event(&asked, &scope) {
            self.take_pending(|p| p.request.id == request_id);
            return Err(e);
        }

        tokio::select! {
            biased;
            resolution = waiter => match resolution {
                Ok(Resolution::Approved) => Ok(()),
                Ok(Resolution::Rejected { feedback: Some(feedback) }) => {
                    Err(AgentError::Corrected { feedback })
                }
                Ok(Resolution::Rejected { feedback: None }) => Err(AgentError::Rejected),
                Ok(Resolution::Interrupted) => Err(AgentError::Interrupted { session_id }),
                Err(_) => Err(AgentError::Rejected),
            },
            () = cancel.cancelled() => {
                for pending in self.take_pending(|p| p.request.id == request_id) {
                    self.publish_replied(&pending.request, PermissionReply::Reject);
                }
                log::info!("Permission request interrupted (request_id={request_id})");
                Err(AgentError::Interrupted { session_id })
            }
        }
    }

    /// Answer a pending request.
    ///
    /// # Errors
    /// Returns `AlreadyResolved` when the request is not pending.
    pub async fn reply(
        &self,
        request_id: &RequestId,
        reply: PermissionReply,
        message: Option<String>,
    ) -> Result<(), AgentError> {
        let Some(pending) = self.take_pending(|p| &p.request.id == request_id).pop() else {
            return Err(AgentError::AlreadyResolved {
                request_id: request_id.clone(),
            });
        };

        log::info!(
            "Permission replied (request_id={request_id}, session_id={}, reply={reply:?})",
            pending.request.session_id
        );
        self.publish_replied(&pending.request, reply);

        match reply {
            PermissionReply::Once => pending.resolve(Resolution::Approved),
            PermissionReply::Reject => {
                let session_id = pending.request.session_id.clone();
                pending.resolve(Resolution::Rejected { feedback: message });
                for other in self.take_pending(|p| p.request.session_id == session_id) {
                    self.publish_replied(&other.request, PermissionReply::Reject);
                    other.resolve(Resolution::Rejected { feedback: None });
                }
            }
            PermissionReply::Always => {
                let scope = pending.scope;
                let rule = PermissionRule::allow(&pending.request.permission, &pending.request.pattern);
                self.remember(scope, &pending.request, rule).await;

                let request = pending.request.clone();
                pending.resolve(Resolution::Approved);
                self.resolve_covered(scope, &request).await;
            }
        }
        Ok(())
    }

    async fn remember(&self, scope: MemoryScope, request: &PermissionRequest, rule: PermissionRule) {
        match scope {
            MemoryScope::Turn => {}
            MemoryScope::Session => {
                let mut approvals = self
                    .session_approvals
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let rules = approvals.entry(request.session_id.clone()).or_default();
                if !rules.contains(&rule) {
                    rules.push(rule);
                }
            }
            MemoryScope::Project | MemoryScope::Persisted => {
                if scope == MemoryScope::Persisted {
                    self.ensure_persisted_loaded(&request.project_id).await;
                }
                {
                    let mut approvals = self
                        .project_approvals
                        .write()
                        .unwrap_or_else(PoisonError::into_inner);
                    let rules = approvals.entry(request.project_id.clone()).or_default();
                    if !rules.contains(&rule) {
                        rules.push(rule.clone());
                    }
                }
                if scope == MemoryScope::Persisted {
                    self.persist(&request.project_id, rule).await;
                }
            }
        }
    }

    async fn resolve_covered(&self, scope: MemoryScope, approved: &PermissionRequest) {
        let mut candidates = Vec::new();
        {
            let pending = self.lock_pending();
            for p in pending.iter() {
                if p.shares_memory_with(approved, scope) {
                    candidates.push(p.request.clone());
                }
            }
        }

        for candidate in candidates {
            let remembered = self
                .remembered_in(scope, &candidate.session_id, &candidate.project_id)
                .await;
            if remembered.evaluate(&candidate.permission, &candidate.pattern) != Effect::Allow {
                continue;
            }
            for p in self.take_pending(|p| p.request.id == candidate.id) {
                log::info!(
                    "Permission auto-approved (request_id={}, session_id={})",
                    p.request.id,
                    p.request.session_id
                );
                self.publish_replied(&p.request, PermissionReply::Always);
                p.resolve(Resolution::Approved);
            }
        }
    }

    async fn ensure_persisted_loaded(&self, project_id: &str) {
        let mut loaded = self.persisted_loaded.lock().await;
        if loaded.contains(project_id) {
            return;
        }
        loaded.insert(project_id.to_string());

        let stored = match self.storage.read(&[APPROVAL_KEY, project_id]).await {
            Ok(Some(value)) => match serde_json::from_value::<Ruleset>(value) {
                Ok(rules) => rules,
                Err(e) => {
                    log::warn!("Invalid persisted permission approvals (project_id={project_id}, error={e})");
                    Ruleset::new()
                }
            },
            Ok(None) => Ruleset::new(),
            Err(e) => {
                log::warn!("Failed to load persisted permission approvals (project_id={project_id}, error={e:#})");
                Ruleset::new()
            }
        };

        let mut approvals = self
            .project_approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let rules = approvals.entry(project_id.to_string()).or_default();
        let mut merged = stored;
        for rule in rules.iter() {
            if !merged.contains(rule) {
                merged.push(rule.clone());
            }
        }
        *rules = merged;
    }

    async fn persist(&self, project_id: &str, rule: PermissionRule) {
        let result = self
            .storage
            .update(
                &[APPROVAL_KEY, project_id],
                Box::new(move |previous| {
                    let mut rules: Ruleset = previous
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    if !rules.contains(&rule) {
                        rules.push(rule);
                    }
                    serde_json::to_value(&rules).unwrap_or(Value::Array(Vec::new()))
                }),
            )
            .await;
        if let Err(e) = result {
            log::warn!("Failed to persist permission approvals (project_id={project_id}, error={e:#})");
        }
    }

    fn take_pending(&self, predicate: impl Fn(&Pending) -> bool) -> Vec<Pending> {
        let mut pending = self.lock_pending();
        let (taken, kept): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| predicate(p));
        *pending = kept;
        taken
    }

    fn publish_replied(&self, request: &PermissionRequest, reply: PermissionReply) {
        let event = PermissionReplied {
            session_id: request.session_id.clone(),
            request_id: request.id.clone(),
            reply,
        };
        if let Err(e) = self
            .bus
            .publish_event(&event, &Scope::session(&request.session_id))
        {
            log::warn!("Failed to publish permission reply (request_id={}, error={e})", request.id);
        }
    }

    /// Force-reject the session's pending requests as interrupted. Remembered
    /// approvals are kept. Returns how many requests were cancelled.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let cancelled = self.take_pending(|p| &p.request.session_id == session_id);
        let count = cancelled.len();
        for p in cancelled {
            self.publish_replied(&p.request, PermissionReply::Reject);
            p.resolve(Resolution::Interrupted);
        }
        count
    }

    /// Reject the session's pending requests and forget its session-scoped
    /// approvals. Called when a session is destroyed.
    pub fn clear_session(&self, session_id: &SessionId) {
        for p in self.take_pending(|p| &p.request.session_id == session_id) {
            self.publish_replied(&p.request, PermissionReply::Reject);
            p.resolve(Resolution::Rejected { feedback: None });
        }
        self.session_approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// Reject everything and drop all in-memory approvals.
    pub async fn shutdown(&self) {
        for p in self.take_pending(|_| true) {
            self.publish_replied(&p.request, PermissionReply::Reject);
            p.resolve(Resolution::Rejected { feedback: None });
        }
        self.session_approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.project_approvals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.persisted_loaded.lock().await.clear();
    }

    /// All pending requests, oldest first.
    #[must_use]
    pub fn list_pending(&self) -> Vec<PermissionRequest> {
        self.lock_pending().iter().map(|p| p.request.clone()).collect()
    }

    #[must_use]
    pub fn pending_for(&self, session_id: &SessionId) -> Vec<PermissionRequest> {
        self.lock_pending()
            .iter()
            .filter(|p| &p.request.session_id == session_id)
            .map(|p| p.request.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventEnvelope;
    use crate::stores::InMemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        guard: Arc<PermissionGuard>,
        bus: Arc<EventBus>,
        storage: Arc<InMemoryStore>,
        events: mpsc::UnboundedReceiver<EventEnvelope>,
    }

    fn harness(scope: MemoryScope) -> Harness {
        let bus = Arc::new(EventBus::with_builtin_events());
        let storage = Arc::new(InMemoryStore::new());
        let (_handle, events) = bus.subscribe_channel(None);
        let guard = Arc::new(PermissionGuard::new(Arc::clone(&bus), storage.clone(), scope));
        Harness {
            guard,
            bus,
            storage,
            events,
        }
    }

    fn ask(session_id: &SessionId, pattern: &str) -> PermissionAsk {
        PermissionAsk {
            session_id: session_id.clone(),
            project_id: "proj".into(),
            permission: "read".into(),
            pattern: pattern.into(),
            reason: AskReason::Rule,
            call_id: None,
            metadata: Value::Null,
        }
    }

    type Waiter = tokio::task::JoinHandle<Result<(), AgentError>>;

    fn spawn_request(guard: &Arc<PermissionGuard>, ask: PermissionAsk, cancel: CancellationToken) -> Waiter {
        let guard = Arc::clone(guard);
        tokio::spawn(async move { guard.request(ask, &cancel).await })
    }

    async fn wait_pending(guard: &PermissionGuard, count: usize) -> anyhow::Result<Vec<PermissionRequest>> {
        for _ in 0..200 {
            let pending = guard.list_pending();
            if pending.len() == count {
                return Ok(pending);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        anyhow::bail!("expected {count} pending requests, found {}", guard.list_pending().len())
    }

    fn replies(events: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<PermissionReplied> {
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            if let Some(r) = e.decode::<PermissionReplied>() {
                out.push(r);
            }
        }
        out
    }

    #[tokio::test]
    async fn once_resolves_only_that_request() -> anyhow::Result<()> {
        let mut h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());

        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Once, None).await?;
        waiter.await??;

        assert!(h.guard.list_pending().is_empty());
        let effect = h.guard.check(&Ruleset::new(), &session, "proj", "read", "a.txt").await;
        assert_eq!(effect, Effect::Ask, "once must not be remembered");

        let asked: Vec<_> = std::iter::from_fn(|| h.events.try_recv().ok()).collect();
        assert!(asked.iter().any(EventEnvelope::is::<PermissionAsked>));
        assert!(asked.iter().any(EventEnvelope::is::<PermissionReplied>));
        Ok(())
    }

    #[tokio::test]
    async fn second_reply_fails_with_already_resolved() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());

        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Once, None).await?;
        let again = h.guard.reply(&pending[0].id, PermissionReply::Reject, None).await;
        assert!(matches!(again, Err(AgentError::AlreadyResolved { .. })));
        assert!(waiter.await?.is_ok());

        let unknown = h
            .guard
            .reply(&RequestId::new(), PermissionReply::Once, None)
            .await;
        assert!(matches!(unknown, Err(AgentError::AlreadyResolved { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn always_in_session_scope_preapproves_same_pattern() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());

        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Always, None).await?;
        waiter.await??;

        let rules = Ruleset::new();
        assert_eq!(h.guard.check(&rules, &session, "proj", "read", "a.txt").await, Effect::Allow);
        assert_eq!(h.guard.check(&rules, &session, "proj", "read", "b.txt").await, Effect::Ask);
        let other = SessionId::new();
        assert_eq!(h.guard.check(&rules, &other, "proj", "read", "a.txt").await, Effect::Ask);
        Ok(())
    }

    #[tokio::test]
    async fn always_cascades_to_covered_pending_requests() -> anyhow::Result<()> {
        let mut h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let first = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        wait_pending(&h.guard, 1).await?;
        let second = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        wait_pending(&h.guard, 2).await?;
        let third = spawn_request(&h.guard, ask(&session, "b.txt"), CancellationToken::new());
        let pending = wait_pending(&h.guard, 3).await?;

        h.guard.reply(&pending[0].id, PermissionReply::Always, None).await?;
        first.await??;
        second.await??;

        let remaining = h.guard.list_pending();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pattern, "b.txt");

        let replied = replies(&mut h.events);
        assert_eq!(replied.len(), 2);
        assert!(replied.iter().all(|r| r.reply == PermissionReply::Always));

        h.guard.reply(&remaining[0].id, PermissionReply::Once, None).await?;
        third.await??;
        Ok(())
    }

    #[tokio::test]
    async fn reject_cascades_to_every_pending_request_of_the_session() -> anyhow::Result<()> {
        let mut h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let other_session = SessionId::new();
        let first = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        wait_pending(&h.guard, 1).await?;
        let second = spawn_request(&h.guard, ask(&session, "b.txt"), CancellationToken::new());
        wait_pending(&h.guard, 2).await?;
        let unrelated = spawn_request(&h.guard, ask(&other_session, "c.txt"), CancellationToken::new());
        wait_pending(&h.guard, 3).await?;

        let target = h.guard.pending_for(&session)[1].id.clone();
        h.guard.reply(&target, PermissionReply::Reject, None).await?;

        assert!(matches!(first.await?, Err(AgentError::Rejected)));
        assert!(matches!(second.await?, Err(AgentError::Rejected)));
        assert!(h.guard.pending_for(&session).is_empty());
        assert_eq!(h.guard.pending_for(&other_session).len(), 1);

        let replied = replies(&mut h.events);
        assert_eq!(replied.len(), 2);
        assert!(replied.iter().all(|r| r.reply == PermissionReply::Reject));

        h.guard.cancel_session(&other_session);
        assert!(matches!(unrelated.await?, Err(AgentError::Interrupted { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn reject_with_message_is_a_correction() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        let pending = wait_pending(&h.guard, 1).await?;

        h.guard
            .reply(&pending[0].id, PermissionReply::Reject, Some("read b.txt instead".into()))
            .await?;
        match waiter.await? {
            Err(AgentError::Corrected { feedback }) => assert_eq!(feedback, "read b.txt instead"),
            other => anyhow::bail!("expected correction, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_force_rejects_pending_request() -> anyhow::Result<()> {
        let mut h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let cancel = CancellationToken::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), cancel.clone());
        let pending = wait_pending(&h.guard, 1).await?;

        cancel.cancel();
        assert!(matches!(waiter.await?, Err(AgentError::Interrupted { .. })));
        assert!(h.guard.list_pending().is_empty());
        assert!(matches!(
            h.guard.reply(&pending[0].id, PermissionReply::Once, None).await,
            Err(AgentError::AlreadyResolved { .. })
        ));

        let replied = replies(&mut h.events);
        assert_eq!(replied.len(), 1);
        assert_eq!(replied[0].reply, PermissionReply::Reject);
        Ok(())
    }

    #[tokio::test]
    async fn turn_scope_never_remembers() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Turn);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Always, None).await?;
        waiter.await??;

        let effect = h.guard.check(&Ruleset::new(), &session, "proj", "read", "a.txt").await;
        assert_eq!(effect, Effect::Ask);
        Ok(())
    }

    #[tokio::test]
    async fn project_scope_is_shared_but_not_durable() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Project);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Always, None).await?;
        waiter.await??;

        let rules = Ruleset::new();
        let sibling = SessionId::new();
        assert_eq!(h.guard.check(&rules, &sibling, "proj", "read", "a.txt").await, Effect::Allow);
        assert_eq!(h.guard.check(&rules, &sibling, "other", "read", "a.txt").await, Effect::Ask);

        // A fresh guard over the same storage models a restart
        let restarted = PermissionGuard::new(Arc::clone(&h.bus), h.storage.clone(), MemoryScope::Project);
        assert_eq!(restarted.check(&rules, &sibling, "proj", "read", "a.txt").await, Effect::Ask);
        Ok(())
    }

    #[tokio::test]
    async fn persisted_scope_survives_restart() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Persisted);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Always, None).await?;
        waiter.await??;

        let stored = h.storage.read(&[APPROVAL_KEY, "proj"]).await?;
        let stored: Ruleset = serde_json::from_value(stored.unwrap_or_default())?;
        assert!(stored.contains(&PermissionRule::allow("read", "a.txt")));

        let restarted = PermissionGuard::new(Arc::clone(&h.bus), h.storage.clone(), MemoryScope::Persisted);
        let effect = restarted
            .check(&Ruleset::new(), &SessionId::new(), "proj", "read", "a.txt")
            .await;
        assert_eq!(effect, Effect::Allow);
        Ok(())
    }

    #[tokio::test]
    async fn remembered_approval_overrides_configured_ask() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let rules: Ruleset = [PermissionRule::ask("read", "*")].into_iter().collect();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Always, None).await?;
        waiter.await??;

        assert_eq!(h.guard.check(&rules, &session, "proj", "read", "a.txt").await, Effect::Allow);
        Ok(())
    }

    #[tokio::test]
    async fn clear_session_rejects_and_forgets() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Session);
        let session = SessionId::new();
        let waiter = spawn_request(&h.guard, ask(&session, "a.txt"), CancellationToken::new());
        let pending = wait_pending(&h.guard, 1).await?;
        h.guard.reply(&pending[0].id, PermissionReply::Always, None).await?;
        waiter.await??;

        let waiter = spawn_request(&h.guard, ask(&session, "z.txt"), CancellationToken::new());
        wait_pending(&h.guard, 1).await?;
        h.guard.clear_session(&session);
        assert!(matches!(waiter.await?, Err(AgentError::Rejected)));

        let effect = h.guard.check(&Ruleset::new(), &session, "proj", "read", "a.txt").await;
        assert_eq!(effect, Effect::Ask);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_rejects_everything() -> anyhow::Result<()> {
        let mut h = harness(MemoryScope::Session);
        let a = spawn_request(&h.guard, ask(&SessionId::new(), "a"), CancellationToken::new());
        let b = spawn_request(&h.guard, ask(&SessionId::new(), "b"), CancellationToken::new());
        let asked = wait_pending(&h.guard, 2).await?;

        h.guard.shutdown().await;
        assert!(matches!(a.await?, Err(AgentError::Rejected)));
        assert!(matches!(b.await?, Err(AgentError::Rejected)));
        assert!(h.guard.list_pending().is_empty());

        let replied = replies(&mut h.events);
        assert_eq!(replied.len(), 2);
        assert!(replied.iter().all(|r| r.reply == PermissionReply::Reject));
        assert!(asked.iter().all(|q| replied.iter().any(|r| r.request_id == q.id)));
        Ok(())
    }

    #[tokio::test]
    async fn broken_persisted_data_is_treated_as_empty() -> anyhow::Result<()> {
        let h = harness(MemoryScope::Persisted);
        h.storage
            .write(&[APPROVAL_KEY, "proj"], serde_json::json!({"not": "a list"}))
            .await?;
        let effect = h
            .guard
            .check(&Ruleset::new(), &SessionId::new(), "proj", "read", "a.txt")
            .await;
        assert_eq!(effect, Effect::Ask);
        Ok(())
    }
}
