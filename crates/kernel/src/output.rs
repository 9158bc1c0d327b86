//! Output handler — turns each agent yield into durable effects: UI
//! events, tool executions, confirmation requests, terminal task events.
//!
//! Batches use a hybrid schedule: contiguous runs of safe calls execute
//! concurrently; risky calls are ordering barriers handled one at a time
//! through the confirmation gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use orchard_domain::agent::AgentOutput;
use orchard_domain::config::{Config, PolicyMode};
use orchard_domain::event::{InteractionRequestedPayload, TaskId};
use orchard_domain::message::ToolCallRequest;
use orchard_domain::tool::{RiskLevel, ToolResult};
use orchard_domain::ui::{OutputKind, UiEvent};
use orchard_domain::Result;
use orchard_tools::{ToolContext, ToolExecutor};

use crate::conversation::ConversationManager;
use crate::ui::UiBus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context and outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-run state threaded through every `handle` call. The confirmation
/// fields are consumed (cleared) by the one risky execution they authorize.
pub struct OutputContext {
    pub task_id: TaskId,
    pub agent_id: String,
    pub author_actor_id: String,
    pub base_dir: std::path::PathBuf,
    pub policy: PolicyMode,
    pub confirmed_interaction_id: Option<String>,
    pub confirmed_tool_call_id: Option<String>,
    pub signal: CancellationToken,
    pub streaming: bool,
}

impl OutputContext {
    pub fn tool_ctx(&self) -> ToolContext {
        ToolContext {
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            author_actor_id: self.author_actor_id.clone(),
            base_dir: self.base_dir.clone(),
            policy: self.policy,
            confirmed_interaction_id: self.confirmed_interaction_id.clone(),
            confirmed_tool_call_id: self.confirmed_tool_call_id.clone(),
            signal: self.signal.clone(),
        }
    }
}

/// What the runtime loop should do after one output was handled.
#[derive(Debug)]
pub enum Disposition {
    /// Keep pulling from the agent.
    Continue,
    /// Append `UserInteractionRequested` and stop — the response resumes us.
    RequestInteraction(InteractionRequestedPayload),
    /// Append `TaskCompleted` and stop.
    Completed { summary: Option<String> },
    /// Append `TaskFailed` and stop.
    Failed { reason: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guards
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Emits heartbeat UI events every `interval` until dropped. Dropping on
/// any exit path stops the timer.
struct HeartbeatGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl HeartbeatGuard {
    fn start(ui: UiBus, task_id: TaskId, tool_call_id: String, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the immediate first tick
            loop {
                ticker.tick().await;
                ui.send(UiEvent::ToolCallHeartbeat {
                    task_id: task_id.clone(),
                    tool_call_id: tool_call_id.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        });
        Self { handle }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Guarantees `tool_calls_batch_end` on every exit path of a batch.
struct BatchGuard {
    ui: UiBus,
    task_id: TaskId,
}

impl BatchGuard {
    fn start(ui: UiBus, task_id: TaskId, safe_count: usize, risky_count: usize) -> Self {
        ui.send(UiEvent::ToolCallsBatchStart {
            task_id: task_id.clone(),
            safe_count,
            risky_count,
        });
        Self { ui, task_id }
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.ui.send(UiEvent::ToolCallsBatchEnd {
            task_id: self.task_id.clone(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OutputHandler {
    conversation: Arc<ConversationManager>,
    executor: Arc<ToolExecutor>,
    ui: UiBus,
    config: Arc<Config>,
}

enum SingleOutcome {
    Executed,
    Paused(InteractionRequestedPayload),
}

impl OutputHandler {
    pub fn new(
        conversation: Arc<ConversationManager>,
        executor: Arc<ToolExecutor>,
        ui: UiBus,
        config: Arc<Config>,
    ) -> Self {
        Self {
            conversation,
            executor,
            ui,
            config,
        }
    }

    pub async fn handle(&self, output: AgentOutput, ctx: &mut OutputContext) -> Result<Disposition> {
        match output {
            AgentOutput::Text { content } => {
                self.emit_text(ctx, OutputKind::Text, content, true);
                Ok(Disposition::Continue)
            }
            AgentOutput::Reasoning { content } => {
                self.emit_text(ctx, OutputKind::Reasoning, content, true);
                Ok(Disposition::Continue)
            }
            AgentOutput::Verbose { content } => {
                self.emit_text(ctx, OutputKind::Verbose, content, false);
                Ok(Disposition::Continue)
            }
            AgentOutput::Error { content } => {
                self.emit_text(ctx, OutputKind::Error, content, false);
                Ok(Disposition::Continue)
            }
            AgentOutput::ToolCall { call } => match self.handle_single(&call, ctx).await? {
                SingleOutcome::Executed => Ok(Disposition::Continue),
                SingleOutcome::Paused(payload) => Ok(Disposition::RequestInteraction(payload)),
            },
            AgentOutput::ToolCalls { calls } => self.handle_batch(calls, ctx).await,
            AgentOutput::Done { summary } => Ok(Disposition::Completed { summary }),
            AgentOutput::Failed { reason } => Ok(Disposition::Failed { reason }),
        }
    }

    /// Streamed text/reasoning has already reached the UI as deltas.
    fn emit_text(&self, ctx: &OutputContext, kind: OutputKind, content: String, streamable: bool) {
        if streamable && ctx.streaming {
            return;
        }
        self.ui.send(UiEvent::AgentOutput {
            task_id: ctx.task_id.clone(),
            kind,
            content,
        });
    }

    // ── Single call ─────────────────────────────────────────────────

    async fn handle_single(
        &self,
        call: &ToolCallRequest,
        ctx: &mut OutputContext,
    ) -> Result<SingleOutcome> {
        let tool_ctx = ctx.tool_ctx();

        // Precondition check: a failure is persisted without execution and
        // without a confirmation prompt.
        if let Some(tool) = self.executor.registry().get(&call.tool_name) {
            if let Err(e) = tool.can_execute(&call.arguments, &tool_ctx) {
                let result = ToolResult::error(e.to_string());
                self.conversation
                    .persist_tool_result_if_missing(&ctx.task_id, call, &result)?;
                return Ok(SingleOutcome::Executed);
            }

            let risky = tool.risk_level(&call.arguments, &tool_ctx) == RiskLevel::Risky;
            if risky && !tool_ctx.confirms(&call.tool_call_id) {
                return Ok(SingleOutcome::Paused(InteractionRequestedPayload {
                    interaction_id: uuid::Uuid::new_v4().to_string(),
                    tool_call_id: call.tool_call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: call.arguments.clone(),
                    prompt: format!("Allow the agent to run '{}'?", call.tool_name),
                    options: vec!["approve".into(), "reject".into()],
                }));
            }

            self.execute_one(call, &tool_ctx).await?;
            if risky {
                // One approval authorizes exactly one invocation.
                ctx.confirmed_interaction_id = None;
                ctx.confirmed_tool_call_id = None;
            }
            return Ok(SingleOutcome::Executed);
        }

        // Unknown tool: the executor produces the error result.
        self.execute_one(call, &tool_ctx).await?;
        Ok(SingleOutcome::Executed)
    }

    /// Execute via the executor with start/end UI events and a heartbeat,
    /// then persist the result idempotently.
    async fn execute_one(
        &self,
        call: &ToolCallRequest,
        tool_ctx: &ToolContext,
    ) -> Result<ToolResult> {
        self.ui.send(UiEvent::ToolCallStart {
            task_id: tool_ctx.task_id.clone(),
            tool_call_id: call.tool_call_id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
        });

        let started = Instant::now();
        let result = {
            let _heartbeat = HeartbeatGuard::start(
                self.ui.clone(),
                tool_ctx.task_id.clone(),
                call.tool_call_id.clone(),
                Duration::from_millis(self.config.runtime.heartbeat_ms),
            );
            self.executor.execute(call, tool_ctx).await?
        };

        self.ui.send(UiEvent::ToolCallEnd {
            task_id: tool_ctx.task_id.clone(),
            tool_call_id: call.tool_call_id.clone(),
            output: result.message_content(),
            is_error: result.is_error,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        self.conversation
            .persist_tool_result_if_missing(&tool_ctx.task_id, call, &result)?;
        Ok(result)
    }

    // ── Batch ───────────────────────────────────────────────────────

    async fn handle_batch(
        &self,
        calls: Vec<ToolCallRequest>,
        ctx: &mut OutputContext,
    ) -> Result<Disposition> {
        if calls.is_empty() {
            return Ok(Disposition::Continue);
        }

        // Counts are fixed at scheduling time.
        let tool_ctx = ctx.tool_ctx();
        let risky_count = calls
            .iter()
            .filter(|c| self.executor.risk_of(c, &tool_ctx) == RiskLevel::Risky)
            .count();
        let _batch = BatchGuard::start(
            self.ui.clone(),
            ctx.task_id.clone(),
            calls.len() - risky_count,
            risky_count,
        );

        let mut cursor = 0;
        while cursor < calls.len() {
            let tool_ctx = ctx.tool_ctx();

            // Contiguous run of safe calls: start all, await all. Results
            // persist idempotently keyed by tool_call_id, so completion
            // order does not matter.
            let segment_end = calls[cursor..]
                .iter()
                .position(|c| self.executor.risk_of(c, &tool_ctx) == RiskLevel::Risky)
                .map(|offset| cursor + offset)
                .unwrap_or(calls.len());

            if segment_end > cursor {
                let futures: Vec<_> = calls[cursor..segment_end]
                    .iter()
                    .map(|call| self.execute_one(call, &tool_ctx))
                    .collect();
                for outcome in join_all(futures).await {
                    // A failure that could not be captured as a ToolResult
                    // fails the whole segment and surfaces upward.
                    outcome?;
                }
                cursor = segment_end;
                continue;
            }

            // Risky barrier: single-call path. A pause returns immediately
            // (the batch guard still emits batch_end).
            match self.handle_single(&calls[cursor], ctx).await? {
                SingleOutcome::Executed => cursor += 1,
                SingleOutcome::Paused(payload) => {
                    return Ok(Disposition::RequestInteraction(payload));
                }
            }
        }

        Ok(Disposition::Continue)
    }
}
