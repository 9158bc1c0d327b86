//! Subtask bridge — `createSubtasks` and `listSubtask`, implemented as
//! ordinary tools so delegation stays inside the conversation.
//!
//! The race discipline: subscribe to the event log *before* creating a
//! child, then read the projection right after creation (catch-up). A child
//! that finishes before its id is known lands in the buffered subscription;
//! one that finished before we looked is caught by the re-read. Every wait
//! is raced against the parent's cancel signal (cascade-cancel) and a hard
//! timeout with a final status re-check.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use orchard_domain::config::Config;
use orchard_domain::event::TaskId;
use orchard_domain::message::Role;
use orchard_domain::task::{TaskPriority, TaskStatus};
use orchard_domain::tool::{RiskLevel, ToolGroup, ToolResult};
use orchard_domain::{Error, Result};
use orchard_store::{ConversationLog, EventLog};
use orchard_tools::{Tool, ToolContext};

use crate::cancel::CancelMap;
use crate::manager::RuntimeManager;
use crate::projection::TaskProjection;
use crate::service::{CreateTaskParams, TaskService};

/// Services both subtask tools share. The manager is held weakly: tools are
/// registered into a registry the kernel owns, and the kernel owns the
/// manager too.
pub struct SubtaskPorts {
    pub config: Arc<Config>,
    pub events: Arc<EventLog>,
    pub conversations: Arc<ConversationLog>,
    pub projection: Arc<TaskProjection>,
    pub service: Arc<TaskService>,
    pub cancel_map: Arc<CancelMap>,
    pub manager: Weak<RuntimeManager>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Arguments and results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubtasksArgs {
    subtasks: Vec<SubtaskSpec>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubtaskSpec {
    title: String,
    #[serde(default)]
    intent: Option<String>,
    agent_id: String,
    #[serde(default)]
    priority: Option<TaskPriority>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubtaskOutcome {
    task_id: TaskId,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    final_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSubtaskArgs {
    task_id: TaskId,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// createSubtasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CreateSubtasksTool {
    ports: Arc<SubtaskPorts>,
}

impl CreateSubtasksTool {
    pub fn new(ports: Arc<SubtaskPorts>) -> Self {
        Self { ports }
    }

    async fn run(&self, args: CreateSubtasksArgs, ctx: &ToolContext) -> Result<ToolResult> {
        let ports = &self.ports;
        let manager = ports
            .manager
            .upgrade()
            .filter(|m| m.is_running())
            .ok_or_else(|| Error::Other("runtime manager is not running".into()))?;

        let parent = ports
            .projection
            .get_task(&ctx.task_id)
            .ok_or_else(|| Error::NotFound(format!("parent task {}", ctx.task_id)))?;
        if parent.parent_task_id.is_some() {
            return Ok(ToolResult::error(
                "createSubtasks is only available to top-level tasks",
            ));
        }

        let depth = ports.projection.ancestor_depth(&ctx.task_id)?;
        if depth + 1 > ports.config.subtasks.max_depth {
            return Err(Error::DepthExceeded(ports.config.subtasks.max_depth));
        }

        for spec in &args.subtasks {
            if !manager.is_registered(&spec.agent_id) {
                return Ok(ToolResult::error(format!(
                    "unknown agent '{}'; registered: {:?}",
                    spec.agent_id,
                    manager.agent_ids()
                )));
            }
        }

        let timeout = Duration::from_secs(
            args.timeout_secs
                .unwrap_or(ports.config.subtasks.timeout_secs),
        );

        // Subscribe before create, per child, so a fast child cannot finish
        // between creation and the wait.
        let mut waiters = Vec::new();
        for spec in args.subtasks {
            let subscription = ports.events.subscribe();
            let child_id = ports.service.create_task(CreateTaskParams {
                title: spec.title,
                intent: spec.intent,
                priority: spec.priority.unwrap_or_default(),
                agent_id: spec.agent_id,
                parent_task_id: Some(ctx.task_id.clone()),
                author_actor_id: format!("task:{}", ctx.task_id),
            })?;
            ports.cancel_map.add_to_group(&ctx.task_id, &child_id);
            waiters.push(wait_for_child(
                ports.clone(),
                ctx.clone(),
                child_id,
                subscription,
                timeout,
            ));
        }

        let outcomes = futures_util::future::join_all(waiters).await;
        for outcome in &outcomes {
            if let Ok(o) = outcome {
                self.ports.cancel_map.remove_from_group(&ctx.task_id, &o.task_id);
            }
        }
        let outcomes: Result<Vec<SubtaskOutcome>> = outcomes.into_iter().collect();
        Ok(ToolResult::ok(serde_json::to_string_pretty(&outcomes?)?))
    }
}

async fn wait_for_child(
    ports: Arc<SubtaskPorts>,
    ctx: ToolContext,
    child_id: TaskId,
    mut subscription: tokio::sync::mpsc::UnboundedReceiver<Arc<orchard_domain::event::StoredEvent>>,
    timeout: Duration,
) -> Result<SubtaskOutcome> {
    // Catch-up: the child may already be terminal.
    if let Some(task) = ports.projection.get_task(&child_id) {
        if task.status.is_terminal() {
            return Ok(outcome_for(&ports, &child_id));
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::select! {
            event = subscription.recv() => {
                match event {
                    Some(event) if event.stream_id == child_id && event.kind.is_terminal() => {
                        return Ok(outcome_for(&ports, &child_id));
                    }
                    Some(_) => continue,
                    None => {
                        // Log gone; fall back to the projection.
                        return Ok(outcome_for(&ports, &child_id));
                    }
                }
            }
            _ = ctx.signal.cancelled() => {
                // Parent canceled or paused: cancel the child best-effort.
                if let Err(e) = ports.service.cancel_task(&child_id, Some("parent canceled".into())) {
                    tracing::debug!(%child_id, error = %e, "cascade cancel skipped");
                }
                return Ok(outcome_for(&ports, &child_id));
            }
            _ = tokio::time::sleep_until(deadline) => {
                // Re-check: the terminal event may have raced the timer.
                if let Some(task) = ports.projection.get_task(&child_id) {
                    if task.status.is_terminal() {
                        return Ok(outcome_for(&ports, &child_id));
                    }
                }
                return Err(Error::TimedOut(format!(
                    "subtask {child_id} still running after {}s",
                    timeout.as_secs()
                )));
            }
        }
    }
}

fn outcome_for(ports: &SubtaskPorts, child_id: &str) -> SubtaskOutcome {
    let task = ports.projection.get_task(child_id);
    let final_message = ports
        .conversations
        .read_stream(child_id, 1)
        .iter()
        .rev()
        .find(|m| m.message.role == Role::Assistant)
        .map(|m| m.message.text().to_owned());

    match task {
        Some(task) => SubtaskOutcome {
            task_id: task.task_id,
            status: task.status,
            summary: task.summary,
            failure_reason: task.failure_reason,
            final_message,
        },
        None => SubtaskOutcome {
            task_id: child_id.to_owned(),
            status: TaskStatus::Failed,
            summary: None,
            failure_reason: Some("task vanished from projection".into()),
            final_message,
        },
    }
}

#[async_trait]
impl Tool for CreateSubtasksTool {
    fn name(&self) -> &str {
        "createSubtasks"
    }

    fn description(&self) -> &str {
        "Delegate work to child tasks run by other agents. Blocks until every child finishes \
         (or a timeout elapses) and returns each child's outcome."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "subtasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "intent": { "type": "string" },
                            "agentId": { "type": "string" },
                            "priority": { "type": "string", "enum": ["foreground", "normal", "background"] }
                        },
                        "required": ["title", "agentId"]
                    }
                },
                "timeoutSecs": { "type": "integer", "description": "Per-child wait timeout" }
            },
            "required": ["subtasks"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Orchestration
    }

    fn risk_level(&self, _args: &Value, _ctx: &ToolContext) -> RiskLevel {
        RiskLevel::Safe
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: CreateSubtasksArgs = serde_json::from_value(args.clone())
            .map_err(|e| Error::Other(format!("invalid createSubtasks arguments: {e}")))?;
        if args.subtasks.is_empty() {
            return Ok(ToolResult::error("no subtasks given"));
        }
        self.run(args, ctx).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// listSubtask
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ListSubtaskTool {
    ports: Arc<SubtaskPorts>,
}

impl ListSubtaskTool {
    pub fn new(ports: Arc<SubtaskPorts>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl Tool for ListSubtaskTool {
    fn name(&self) -> &str {
        "listSubtask"
    }

    fn description(&self) -> &str {
        "Inspect one of this task's subtasks: current status, summary, and final message."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string", "description": "Subtask id returned by createSubtasks" }
            },
            "required": ["taskId"]
        })
    }

    fn group(&self) -> ToolGroup {
        ToolGroup::Orchestration
    }

    fn risk_level(&self, _args: &Value, _ctx: &ToolContext) -> RiskLevel {
        RiskLevel::Safe
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolResult> {
        let args: ListSubtaskArgs = serde_json::from_value(args.clone())
            .map_err(|e| Error::Other(format!("invalid listSubtask arguments: {e}")))?;

        let Some(child) = self.ports.projection.get_task(&args.task_id) else {
            return Ok(ToolResult::error(format!("no such task: {}", args.task_id)));
        };
        if child.parent_task_id.as_deref() != Some(ctx.task_id.as_str()) {
            return Ok(ToolResult::error(format!(
                "task {} is not a subtask of {}",
                args.task_id, ctx.task_id
            )));
        }

        let outcome = outcome_for(&self.ports, &args.task_id);
        Ok(ToolResult::ok(serde_json::to_string_pretty(&outcome)?))
    }
}
