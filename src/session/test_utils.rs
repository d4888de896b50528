use crate::bus::EventEnvelope;
use crate::error::ProviderError;
use crate::llm::{LlmProvider, StopReason, StreamBox, StreamChunk, StreamRequest};
use crate::permission::{PermissionGuard, PermissionRequest};
use crate::tools::{Tool, ToolContext, ToolName, ToolOutput};
use crate::types::{SessionId, TokenUsage};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

// ===================
// Mock LLM Provider
// ===================

/// One scripted model call.
#[derive(Clone, Debug)]
pub enum Script {
    /// Yield these items, then end
    Chunks(Vec<Result<StreamChunk, ProviderError>>),
    /// Yield these items, then never finish
    Stall(Vec<StreamChunk>),
    /// Fail before the stream opens
    Refuse(ProviderError),
}

pub struct MockProvider {
    scripts: RwLock<Vec<Script>>,
    requests: RwLock<Vec<StreamRequest>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: RwLock::new(scripts),
            requests: RwLock::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        })
    }

    pub fn text(text: &str) -> Script {
        Script::Chunks(vec![
            Ok(StreamChunk::TextDelta(text.to_string())),
            Ok(StreamChunk::Usage(usage())),
            Ok(StreamChunk::Finish(StopReason::EndTurn)),
        ])
    }

    pub fn tool_call(id: &str, name: &str, input: Value) -> Script {
        Self::tool_calls(vec![(id, name, input)])
    }

    pub fn tool_calls(calls: Vec<(&str, &str, Value)>) -> Script {
        let mut chunks: Vec<_> = calls
            .into_iter()
            .map(|(id, name, input)| {
                Ok(StreamChunk::ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk::Usage(usage())));
        chunks.push(Ok(StreamChunk::Finish(StopReason::ToolUse)));
        Script::Chunks(chunks)
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn usage() -> TokenUsage {
    TokenUsage {
        input_tokens: 10,
        output_tokens: 20,
        ..TokenUsage::default()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn stream(&self, request: StreamRequest) -> Result<StreamBox, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        let script = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(idx)
            .cloned()
            // Default: end the conversation
            .unwrap_or_else(|| Self::text("Done"));

        match script {
            Script::Chunks(items) => Ok(futures::stream::iter(items).boxed()),
            Script::Stall(chunks) => Ok(futures::stream::iter(chunks.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            Script::Refuse(error) => Err(error),
        }
    }

    fn model(&self) -> &'static str {
        "mock-model"
    }

    fn provider(&self) -> &'static str {
        "mock"
    }
}

// ===================
// Event helpers
// ===================

/// Everything received so far, without waiting.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn event_types(events: &[EventEnvelope]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

/// Poll until `session` has `count` pending permission requests.
pub async fn wait_for_pending(
    guard: &PermissionGuard,
    session: &SessionId,
    count: usize,
) -> Result<Vec<PermissionRequest>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let pending = guard.pending_for(session);
            if pending.len() >= count {
                return pending;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for {count} pending requests"))
}

// ===================
// Mock Tools
// ===================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestToolName {
    Echo,
    Read,
    Fail,
}

impl ToolName for TestToolName {}

pub struct EchoTool;

impl Tool for EchoTool {
    type Name = TestToolName;

    fn name(&self) -> TestToolName {
        TestToolName::Echo
    }

    fn description(&self) -> &'static str {
        "Echo the input message"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        let message = input
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        Ok(ToolOutput::new(format!("Echo: {message}")).with_title("echo"))
    }
}

/// Pretends to read a file; guarded by the `read` permission on the path.
#[derive(Default)]
pub struct ReadFileTool {
    pub calls: Arc<AtomicUsize>,
}

impl ReadFileTool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tool for ReadFileTool {
    type Name = TestToolName;

    fn name(&self) -> TestToolName {
        TestToolName::Read
    }

    fn description(&self) -> &'static str {
        "Read a file"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    fn permission(&self) -> Option<&'static str> {
        Some("read")
    }

    fn permission_pattern(&self, input: &Value) -> String {
        input
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("*")
            .to_string()
    }

    async fn execute(&self, _ctx: &ToolContext, input: Value) -> Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = input
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(ToolOutput::new(format!("contents of {path}")).with_title(path))
    }
}

pub struct FailingTool;

impl Tool for FailingTool {
    type Name = TestToolName;

    fn name(&self) -> TestToolName {
        TestToolName::Fail
    }

    fn description(&self) -> &'static str {
        "Always fails"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _ctx: &ToolContext, _input: Value) -> Result<ToolOutput> {
        Err(anyhow::anyhow!("disk on fire"))
    }
}
