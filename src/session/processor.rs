use super::helpers::sanitize_text;
use super::retry::RetryPolicy;
use super::tool_execution::ToolExecutor;
use super::types::{AttemptFailure, ProcessorResult, RetryError, TurnInput};
use crate::bus::{BusEvent, EventBus, Scope};
use crate::error::{AgentError, ErrorCode};
use crate::events::{MessageUpdated, PartDelta, PartUpdated};
use crate::llm::{LlmProvider, StreamChunk, StreamRequest, ToolCallAccumulator, ToolCallRequest};
use crate::message::{Message, Part, PartKind, ToolState};
use crate::tools::ToolContext;
use crate::types::{PartId, SessionStatus, TokenUsage};
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const ABORTED: &str = "Tool execution aborted";

/// What one streaming attempt produced before tool dispatch.
struct Draft {
    message: Message,
    calls: Vec<ToolCallRequest>,
    usage: TokenUsage,
    interrupted: bool,
}

/// Runs a single turn: stream the model response, then execute the tool
/// calls it asked for, strictly in emission order.
pub(crate) struct SessionProcessor<'a> {
    pub(crate) provider: &'a dyn LlmProvider,
    pub(crate) executor: &'a ToolExecutor,
    pub(crate) bus: &'a Arc<EventBus>,
    pub(crate) retry: RetryPolicy,
    pub(crate) turn_retries: u32,
    pub(crate) continue_loop_on_deny: bool,
}

impl SessionProcessor<'_> {
    /// Process one turn.
    ///
    /// Tool and permission failures are recorded on the tool parts. Fatal
    /// provider errors and unexpected executor errors are returned.
    pub(crate) async fn process(&self, input: TurnInput<'_>) -> Result<ProcessorResult, AgentError> {
        let session_id = input.entry.id();
        let request = StreamRequest {
            session_id: session_id.clone(),
            system: input.system.map(str::to_string),
            messages: input.history,
            tools: input.tools.to_vec(),
        };

        let mut reissues = 0u32;
        let draft = loop {
            let this = self;
            let request_ref = &request;
            let cancel = input.cancel;
            let result = self
                .retry
                .run(cancel, move |attempt| this.stream_attempt(request_ref, cancel, attempt))
                .await;

            match result {
                Ok(draft) => break draft,
                Err(RetryError::Interrupted) => {
                    let mut message = Message::assistant(session_id.clone());
                    message.complete();
                    self.publish_message(&message, true);
                    return Ok(ProcessorResult {
                        message,
                        tool_calls: 0,
                        blocked: false,
                        interrupted: true,
                        usage: TokenUsage::default(),
                    });
                }
                Err(RetryError::Fatal(err)) => return Err(AgentError::Provider(err)),
                Err(RetryError::Partial(err)) => {
                    reissues += 1;
                    if reissues > self.turn_retries {
                        return Err(AgentError::Provider(err.into_fatal(reissues)));
                    }
                    warn!(
                        "Discarding partial turn and re-issuing (session_id={session_id}, reissue={reissues}, error={err})"
                    );
                }
            }
        };

        let Draft {
            mut message,
            calls,
            usage,
            mut interrupted,
        } = draft;
        let mut blocked = false;

        if !calls.is_empty() && !interrupted {
            input.entry.set_status(self.bus, SessionStatus::ToolExecuting);
        }

        for call in &calls {
            if interrupted || blocked {
                self.finish_tool(
                    &mut message,
                    &call.call_id,
                    ToolState::Error {
                        error: ABORTED.to_string(),
                        code: ErrorCode::Interrupted,
                    },
                );
                continue;
            }
            if let Some(reason) = &call.invalid {
                self.finish_tool(
                    &mut message,
                    &call.call_id,
                    ToolState::Error {
                        error: reason.clone(),
                        code: ErrorCode::ToolFailed,
                    },
                );
                continue;
            }

            self.finish_tool(&mut message, &call.call_id, ToolState::Running);
            let ctx = ToolContext::new(
                session_id.clone(),
                input.entry.project_id(),
                message.id.clone(),
                call.call_id.clone(),
            )
            .with_cancel(input.cancel.clone())
            .with_bus(Arc::clone(self.bus));

            let state = match self
                .executor
                .execute(&call.tool, call.input.clone(), &ctx, input.rules)
                .await
            {
                Ok(output) => ToolState::Completed {
                    output: output.output,
                    title: output.title,
                    metadata: Value::Object(output.metadata),
                    compacted: false,
                },
                Err(e) if e.is_interrupted() => {
                    interrupted = true;
                    ToolState::Error {
                        error: e.to_string(),
                        code: e.code(),
                    }
                }
                Err(e) if e.is_recoverable() => {
                    if e.blocks_turn() && !self.continue_loop_on_deny {
                        info!(
                            "Tool call blocked, stopping loop (session_id={session_id}, tool={}, code={})",
                            call.tool,
                            e.code().as_str()
                        );
                        blocked = true;
                    }
                    ToolState::Error {
                        error: e.to_string(),
                        code: e.code(),
                    }
                }
                Err(e) => return Err(e),
            };
            self.finish_tool(&mut message, &call.call_id, state);

            if input.cancel.is_cancelled() {
                interrupted = true;
            }
        }

        if interrupted {
            self.abort_unfinished(&mut message);
        }

        message.usage = usage;
        message.complete();
        self.publish_message(&message, true);

        Ok(ProcessorResult {
            message,
            tool_calls: calls.len(),
            blocked,
            interrupted,
            usage,
        })
    }

    /// One streaming attempt. A provider error is reported as partial when
    /// anything already reached observers.
    async fn stream_attempt(
        &self,
        request: &StreamRequest,
        cancel: &CancellationToken,
        attempt: u32,
    ) -> Result<Draft, AttemptFailure> {
        let mut message = Message::assistant(request.session_id.clone());
        let mut usage = TokenUsage::default();
        self.publish_message(&message, false);

        debug!(
            "Starting model stream (session_id={}, attempt={attempt}, provider={}, model={})",
            request.session_id,
            self.provider.provider(),
            self.provider.model()
        );

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            opened = self.provider.stream(request.clone()) => Some(opened),
        };
        let mut stream = match opened {
            None => return Ok(Draft::interrupted(message, usage)),
            Some(Ok(stream)) => stream,
            Some(Err(error)) => {
                return Err(AttemptFailure {
                    error,
                    partial: false,
                });
            }
        };

        let mut accumulator = ToolCallAccumulator::new();
        let mut calls = Vec::new();
        let mut text_part: Option<PartId> = None;
        let mut reasoning_part: Option<PartId> = None;
        let mut emitted = false;
        let mut interrupted = false;
        let mut chunk_count = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                next = stream.next() => next,
            };
            let Some(next) = next else {
                break;
            };
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(error) => {
                    return Err(AttemptFailure {
                        error,
                        partial: emitted,
                    });
                }
            };
            chunk_count += 1;

            match &chunk {
                StreamChunk::TextDelta(delta) => {
                    emitted |= self.append_delta(&mut message, &mut text_part, false, delta);
                }
                StreamChunk::ReasoningDelta(delta) => {
                    emitted |= self.append_delta(&mut message, &mut reasoning_part, true, delta);
                }
                StreamChunk::ToolCallStart { id, name }
                | StreamChunk::ToolCall { id, name, .. } => {
                    if tool_part(&message, id).is_none() {
                        let part_id = message.push(PartKind::Tool {
                            call_id: id.clone(),
                            tool: name.clone(),
                            input: Value::Object(serde_json::Map::new()),
                            state: ToolState::Pending,
                        });
                        self.publish_part(&message, &part_id);
                        emitted = true;
                    }
                }
                StreamChunk::Usage(chunk_usage) => usage.add(chunk_usage),
                StreamChunk::Finish(reason) => {
                    debug!(
                        "Model stream finished (session_id={}, reason={reason:?}, chunks={chunk_count})",
                        request.session_id
                    );
                }
                StreamChunk::ToolCallDelta { .. } | StreamChunk::ToolCallEnd { .. } => {}
            }

            if let Some(call) = accumulator.apply(&chunk) {
                self.set_tool_input(&mut message, &call);
                calls.push(call);
            }
        }

        if !interrupted {
            for call in accumulator.finish() {
                self.set_tool_input(&mut message, &call);
                calls.push(call);
            }
        }

        for part_id in [text_part, reasoning_part].into_iter().flatten() {
            self.publish_part(&message, &part_id);
        }

        Ok(Draft {
            message,
            calls,
            usage,
            interrupted,
        })
    }

    /// Append a sanitized delta to the running text or reasoning part.
    /// Returns whether anything was published.
    fn append_delta(
        &self,
        message: &mut Message,
        slot: &mut Option<PartId>,
        reasoning: bool,
        delta: &str,
    ) -> bool {
        if delta.is_empty() {
            return false;
        }
        let delta = sanitize_text(delta);
        let part_id = slot
            .get_or_insert_with(|| {
                let text = String::new();
                message.push(if reasoning {
                    PartKind::Reasoning { text }
                } else {
                    PartKind::Text { text }
                })
            })
            .clone();

        if let Some(Part {
            kind: PartKind::Text { text } | PartKind::Reasoning { text },
            ..
        }) = message.part_mut(&part_id)
        {
            text.push_str(&delta);
        }

        self.publish(&PartDelta {
            session_id: message.session_id.clone(),
            message_id: message.id.clone(),
            part_id,
            field: "text".to_string(),
            delta: delta.into_owned(),
        }, &message.session_id);
        true
    }

    fn set_tool_input(&self, message: &mut Message, call: &ToolCallRequest) {
        let Some(part_id) = tool_part(message, &call.call_id) else {
            return;
        };
        if let Some(Part {
            kind: PartKind::Tool { input, .. },
            ..
        }) = message.part_mut(&part_id)
        {
            input.clone_from(&call.input);
        }
        self.publish_part(message, &part_id);
    }

    fn finish_tool(&self, message: &mut Message, call_id: &str, next: ToolState) {
        let Some(part_id) = tool_part(message, call_id) else {
            warn!("Tool result for unknown call (call_id={call_id})");
            return;
        };
        let changed = match message.part_mut(&part_id) {
            Some(Part {
                kind: PartKind::Tool { state, .. },
                ..
            }) => state.advance(next),
            _ => false,
        };
        if changed {
            self.publish_part(message, &part_id);
        }
    }

    /// Tool parts the stream opened but never completed.
    fn abort_unfinished(&self, message: &mut Message) {
        let open: Vec<String> = message
            .parts
            .iter()
            .filter_map(|p| match &p.kind {
                PartKind::Tool { call_id, state, .. } if !state.is_finished() => {
                    Some(call_id.clone())
                }
                _ => None,
            })
            .collect();
        for call_id in open {
            self.finish_tool(
                message,
                &call_id,
                ToolState::Error {
                    error: ABORTED.to_string(),
                    code: ErrorCode::Interrupted,
                },
            );
        }
    }

    fn publish_part(&self, message: &Message, part_id: &PartId) {
        if let Some(part) = message.part(part_id) {
            self.publish(
                &PartUpdated {
                    session_id: message.session_id.clone(),
                    part: part.clone(),
                },
                &message.session_id,
            );
        }
    }

    fn publish_message(&self, message: &Message, completed: bool) {
        self.publish(
            &MessageUpdated {
                session_id: message.session_id.clone(),
                message_id: message.id.clone(),
                role: message.role,
                completed,
                usage: message.usage,
            },
            &message.session_id,
        );
    }

    fn publish<E: BusEvent>(&self, event: &E, session_id: &crate::types::SessionId) {
        if let Err(e) = self.bus.publish_event(event, &Scope::session(session_id)) {
            warn!("Failed to publish event (event_type={}, error={e})", E::TYPE);
        }
    }
}

impl Draft {
    fn interrupted(mut message: Message, usage: TokenUsage) -> Self {
        message.complete();
        Self {
            message,
            calls: Vec::new(),
            usage,
            interrupted: true,
        }
    }
}

fn tool_part(message: &Message, call_id: &str) -> Option<PartId> {
    message.parts.iter().find_map(|p| match &p.kind {
        PartKind::Tool { call_id: id, .. } if id == call_id => Some(p.id.clone()),
        _ => None,
    })
}
