//! Scripted test doubles: a deterministic LLM client and configurable
//! tools. Used by the unit tests in this crate, the integration suites
//! under `tests/`, and anyone embedding the kernel who wants hermetic
//! tests without a provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use orchard_domain::llm::{ChatRequest, ChatResponse, LlmClient};
use orchard_domain::message::ToolCallRequest;
use orchard_domain::stream::{BoxStream, StreamEvent, Usage};
use orchard_domain::tool::{RiskLevel, ToolGroup, ToolResult};
use orchard_domain::{Error, Result};
use orchard_store::AuditLog;
use orchard_tools::{Tool, ToolContext, ToolExecutor, ToolRegistry};

/// Safe tool names registered by [`tools_fixture`].
pub const SAFE_TOOL: &str = "readFile";
pub const SAFE_TOOL_2: &str = "glob";
pub const SAFE_TOOL_3: &str = "grep";
/// Risky tool names registered by [`tools_fixture`].
pub const RISKY_TOOL: &str = "runCommand";
pub const RISKY_TOOL_2: &str = "editFile";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recorder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Collects start/end markers from scripted tools so tests can assert on
/// execution order and overlap.
#[derive(Default)]
pub struct Recorder {
    entries: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn log(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScriptedTool {
    name: String,
    risk: RiskLevel,
    delay: Duration,
    fail_with: Option<String>,
    precondition_error: Option<String>,
    recorder: Option<Arc<Recorder>>,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            name: name.into(),
            risk,
            delay: Duration::ZERO,
            fail_with: None,
            precondition_error: None,
            recorder: None,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn precondition_failing(mut self, message: impl Into<String>) -> Self {
        self.precondition_error = Some(message.into());
        self
    }

    pub fn recording(mut self, recorder: Arc<Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "value": { "type": "string" } }
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Other
    }

    fn risk_level(&self, _args: &Value, _ctx: &ToolContext) -> RiskLevel {
        self.risk
    }

    fn can_execute(&self, _args: &Value, _ctx: &ToolContext) -> Result<()> {
        match &self.precondition_error {
            Some(message) => Err(Error::Other(message.clone())),
            None => Ok(()),
        }
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let value = args
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if let Some(recorder) = &self.recorder {
            recorder.log(format!("start:{}:{value}", self.name));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(recorder) = &self.recorder {
            recorder.log(format!("end:{}:{value}", self.name));
        }
        if let Some(message) = &self.fail_with {
            return Err(Error::Other(message.clone()));
        }
        Ok(ToolResult::ok(format!("{} ran: {value}", self.name)))
    }
}

/// Registry + executor with the standard safe/risky tool set, auditing
/// into `<dir>/audit.jsonl`.
pub fn tools_fixture(dir: &std::path::Path) -> (Arc<ToolExecutor>, Arc<ToolRegistry>) {
    let audit = Arc::new(AuditLog::open(dir.join("audit.jsonl")).expect("audit log"));
    let registry = Arc::new(ToolRegistry::new());
    for name in [SAFE_TOOL, SAFE_TOOL_2, SAFE_TOOL_3] {
        registry
            .register(Arc::new(ScriptedTool::new(name, RiskLevel::Safe)))
            .expect("register safe tool");
    }
    for name in [RISKY_TOOL, RISKY_TOOL_2] {
        registry
            .register(Arc::new(ScriptedTool::new(name, RiskLevel::Risky)))
            .expect("register risky tool");
    }
    let executor = Arc::new(ToolExecutor::new(registry.clone(), audit));
    (executor, registry)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A deterministic LLM client: each call pops the next scripted response.
/// The streaming path synthesizes the event sequence a real provider would
/// send for the same response.
pub struct ScriptedLlm {
    script: Mutex<VecDeque<ChatResponse>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
        }
    }

    pub fn push(&self, turn: ChatResponse) {
        self.script.lock().push_back(turn);
    }

    /// A plain text response.
    pub fn text(content: impl Into<String>) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        }
    }

    /// A response that requests tool calls.
    pub fn tools(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            reasoning: None,
            tool_calls: calls,
            usage: None,
        }
    }

    fn next(&self) -> Result<ChatResponse> {
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Llm("scripted LLM exhausted".into()))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _req: ChatRequest) -> Result<ChatResponse> {
        self.next()
    }

    async fn stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let resp = self.next()?;
        let mut events = Vec::new();
        if let Some(reasoning) = &resp.reasoning {
            events.push(StreamEvent::Reasoning {
                text: reasoning.clone(),
            });
        }
        // Split the text into two chunks to exercise delta merging.
        if !resp.content.is_empty() {
            let mid = resp.content.len() / 2;
            let mid = (0..=mid)
                .rev()
                .find(|i| resp.content.is_char_boundary(*i))
                .unwrap_or(0);
            let (a, b) = resp.content.split_at(mid);
            for chunk in [a, b] {
                if !chunk.is_empty() {
                    events.push(StreamEvent::Token {
                        text: chunk.to_owned(),
                    });
                }
            }
        }
        for call in &resp.tool_calls {
            events.push(StreamEvent::ToolCallStarted {
                call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
            });
            events.push(StreamEvent::ToolCallFinished {
                call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
            });
        }
        events.push(StreamEvent::Done {
            usage: resp.usage.clone(),
            finish_reason: Some(if resp.tool_calls.is_empty() {
                "stop".into()
            } else {
                "tool_calls".into()
            }),
        });
        Ok(Box::pin(futures_util::stream::iter(
            events.into_iter().map(Ok),
        )))
    }
}

/// An LLM client whose requests never resolve — for tests that need a task
/// to hang until something cancels it.
pub struct PendingLlm;

#[async_trait]
impl LlmClient for PendingLlm {
    async fn complete(&self, _req: ChatRequest) -> Result<ChatResponse> {
        futures_util::future::pending().await
    }

    async fn stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        futures_util::future::pending().await
    }
}

/// A tool call request literal for tests.
pub fn call(id: &str, name: &str) -> ToolCallRequest {
    ToolCallRequest {
        tool_call_id: id.into(),
        tool_name: name.into(),
        arguments: serde_json::json!({ "value": id }),
    }
}
