use super::helpers::millis_to_u64;
use crate::bus::{EventBus, Scope};
use crate::doom_loop::{DoomLoopDetector, DoomSignature};
use crate::error::AgentError;
use crate::events::{ToolCompleted, ToolFailed};
use crate::permission::{AskReason, Effect, PermissionAsk, PermissionGuard, Ruleset};
use crate::tools::{ToolContext, ToolOutput, ToolRegistry};
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

/// Runs one tool call through the permission pipeline.
///
/// Order of checks:
/// 1. the tool must be registered
/// 2. the input must be a JSON object
/// 3. a doom loop forces `ask` whatever the rules say
/// 4. otherwise the merged rules decide (`deny` fails without executing)
/// 5. `ask` waits for a human reply
///
/// Tool failures are wrapped as [`AgentError::Tool`]; they are recoverable
/// and become tool-result content for the model.
pub struct ToolExecutor {
    tools: Arc<ToolRegistry>,
    guard: Arc<PermissionGuard>,
    doom: Arc<DoomLoopDetector>,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl ToolExecutor {
    #[must_use]
    pub const fn new(
        tools: Arc<ToolRegistry>,
        guard: Arc<PermissionGuard>,
        doom: Arc<DoomLoopDetector>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            tools,
            guard,
            doom,
            bus,
        }
    }

    /// Execute `tool` with `input` under `rules`, publishing `tool.completed`
    /// or `tool.error`.
    ///
    /// # Errors
    /// - `UnknownTool`, `Denied`, `Rejected`, `Corrected`, `Tool`: recoverable
    /// - `Interrupted`: the session was interrupted while waiting for a reply
    /// - anything else is unexpected and should stop the loop
    pub async fn execute(
        &self,
        tool: &str,
        input: Value,
        ctx: &ToolContext,
        rules: &Ruleset,
    ) -> Result<ToolOutput, AgentError> {
        let result = self.run(tool, input, ctx, rules).await;
        let scope = Scope::session(&ctx.session_id);

        let published = match &result {
            Ok(output) => {
                let duration_ms = output
                    .metadata
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                self.bus.publish_event(
                    &ToolCompleted {
                        session_id: ctx.session_id.clone(),
                        call_id: ctx.call_id.clone(),
                        tool: tool.to_string(),
                        title: output.title.clone(),
                        duration_ms,
                    },
                    &scope,
                )
            }
            Err(e) => self.bus.publish_event(
                &ToolFailed {
                    session_id: ctx.session_id.clone(),
                    call_id: ctx.call_id.clone(),
                    tool: tool.to_string(),
                    error: e.to_string(),
                    code: e.code(),
                },
                &scope,
            ),
        };
        if let Err(e) = published {
            warn!("Failed to publish tool result (call_id={}, error={e})", ctx.call_id);
        }

        result
    }

    async fn run(
        &self,
        name: &str,
        input: Value,
        ctx: &ToolContext,
        rules: &Ruleset,
    ) -> Result<ToolOutput, AgentError> {
        let Some(tool) = self.tools.get(name) else {
            warn!("Model requested unknown tool (tool={name}, call_id={})", ctx.call_id);
            return Err(AgentError::UnknownTool {
                name: name.to_string(),
            });
        };

        if !input.is_object() {
            return Err(AgentError::tool(
                name,
                "Invalid tool input: expected a JSON object",
            ));
        }

        let permission = tool.permission().to_string();
        let pattern = tool.permission_pattern(&input);

        let doom_loop = self
            .doom
            .check(&ctx.session_id, DoomSignature::new(name, &input));
        let effect = if doom_loop {
            Effect::Ask
        } else {
            self.guard
                .check(rules, &ctx.session_id, &ctx.project_id, &permission, &pattern)
                .await
        };

        match effect {
            Effect::Allow => {}
            Effect::Deny => {
                info!("Tool call denied by rule (tool={name}, permission={permission}, pattern={pattern})");
                return Err(AgentError::Denied {
                    rules: rules.describe_for(&permission),
                    permission,
                    pattern,
                });
            }
            Effect::Ask => {
                let reason = if doom_loop {
                    AskReason::DoomLoop
                } else {
                    AskReason::Rule
                };
                let ask = PermissionAsk {
                    session_id: ctx.session_id.clone(),
                    project_id: ctx.project_id.clone(),
                    permission,
                    pattern,
                    reason,
                    call_id: Some(ctx.call_id.clone()),
                    metadata: json!({ "tool": name, "input": input }),
                };
                self.guard.request(ask, &ctx.cancel).await?;
            }
        }

        debug!("Executing tool (tool={name}, call_id={})", ctx.call_id);
        let started = Instant::now();
        let output = tool
            .execute(ctx, input)
            .await
            .map_err(|e| AgentError::tool(name, format!("{e:#}")))?;
        let duration_ms = millis_to_u64(started.elapsed().as_millis());

        Ok(output.with_metadata("duration_ms", json!(duration_ms)))
    }
}
