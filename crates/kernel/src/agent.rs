//! Agent contract — the generator abstraction the runtime drives.
//!
//! An agent is a bounded, cooperative producer: given a task and a context
//! it returns a finite lazy stream of [`AgentOutput`] values that ends after
//! one terminal output, or whenever the consumer stops pulling (dropping
//! the stream must release whatever the producer holds).

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use orchard_domain::agent::AgentOutput;
use orchard_domain::event::{InteractionRespondedPayload, TaskId};
use orchard_domain::llm::LlmClient;
use orchard_domain::message::{ChatMessage, StoredMessage};
use orchard_domain::stream::BoxStream;
use orchard_domain::task::Task;
use orchard_domain::Result;
use orchard_tools::ToolRegistry;

use crate::conversation::ConversationManager;
use crate::ui::UiBus;

pub type OutputStream = BoxStream<'static, Result<AgentOutput>>;

/// Concrete agent implementations are plugged via registration on the
/// runtime manager, not inheritance.
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    fn run(&self, task: Task, ctx: AgentContext) -> OutputStream;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skill catalog port
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Narrow port over skill discovery: the kernel only ever asks for the
/// rendered index that goes into the system prompt.
pub trait SkillCatalog: Send + Sync {
    fn render_index(&self) -> String;
}

/// The default catalog: no skills.
pub struct NoSkills;

impl SkillCatalog for NoSkills {
    fn render_index(&self) -> String {
        String::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The agent's view of its conversation: immutable snapshots plus the
/// persist callback bound to this task.
#[derive(Clone)]
pub struct ConversationHandle {
    manager: Arc<ConversationManager>,
    task_id: TaskId,
}

impl ConversationHandle {
    pub fn new(manager: Arc<ConversationManager>, task_id: TaskId) -> Self {
        Self { manager, task_id }
    }

    /// A fresh snapshot of the persisted history.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.manager.history(&self.task_id)
    }

    pub fn persist(&self, message: ChatMessage) -> Result<Arc<StoredMessage>> {
        self.manager.persist(&self.task_id, message)
    }

    /// Open tool calls of the latest assistant message in the snapshot.
    pub fn open_tool_calls(&self) -> Vec<orchard_domain::message::ToolCallRequest> {
        ConversationManager::open_tool_calls(&self.snapshot())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything an agent may consult while producing outputs.
#[derive(Clone)]
pub struct AgentContext {
    pub task_id: TaskId,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
    pub skills: Arc<dyn SkillCatalog>,
    pub base_dir: PathBuf,
    pub history: ConversationHandle,
    /// Present when the run was triggered by an interaction response.
    pub pending_response: Option<InteractionRespondedPayload>,
    pub streaming: bool,
    pub ui: UiBus,
    /// Fires on pause/cancel; cooperative.
    pub signal: CancellationToken,
    pub max_loops: u32,
}
