//! Per-invocation context threaded into every tool call.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use orchard_domain::config::PolicyMode;
use orchard_domain::event::TaskId;

/// Everything a tool may consult while executing. Cloneable so concurrent
/// safe-segment calls can each carry one.
#[derive(Clone)]
pub struct ToolContext {
    pub task_id: TaskId,
    pub agent_id: String,
    /// Actor recorded in audit rows (`agent:<id>` for agent-originated calls).
    pub author_actor_id: String,
    /// Workspace base directory for filesystem-scoped tools.
    pub base_dir: PathBuf,
    /// Risk policy in effect right now.
    pub policy: PolicyMode,
    /// Present when the user approved an interaction this run.
    pub confirmed_interaction_id: Option<String>,
    /// The single tool call that approval authorizes.
    pub confirmed_tool_call_id: Option<String>,
    /// Fires when the task is paused or canceled mid-tool. Cooperative:
    /// tools that ignore it are allowed to finish.
    pub signal: CancellationToken,
}

impl ToolContext {
    /// A minimal context for one task, used by repairs and tests.
    pub fn for_task(task_id: impl Into<TaskId>, agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            task_id: task_id.into(),
            author_actor_id: format!("agent:{agent_id}"),
            agent_id,
            base_dir: PathBuf::from("."),
            policy: PolicyMode::default(),
            confirmed_interaction_id: None,
            confirmed_tool_call_id: None,
            signal: CancellationToken::new(),
        }
    }

    /// Whether this context's approval is bound to the given call.
    pub fn confirms(&self, tool_call_id: &str) -> bool {
        self.confirmed_interaction_id.is_some()
            && self.confirmed_tool_call_id.as_deref() == Some(tool_call_id)
    }
}
