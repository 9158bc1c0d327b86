//! Agent runtime — one instance per agent id. Receives domain events from
//! the runtime manager's fan-out, owns the in-flight/paused/queued sets for
//! its agent, and drives one task generator at a time per task.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::Instrument;

use orchard_domain::config::Config;
use orchard_domain::event::{
    EventKind, InstructionPayload, InteractionRequestedPayload, InteractionRespondedPayload,
    StoredEvent, TaskId,
};
use orchard_domain::llm::LlmClient;
use orchard_domain::task::{Task, TaskStatus};
use orchard_domain::Result;
use orchard_store::EventLog;
use orchard_tools::ToolRegistry;

use crate::agent::{Agent, AgentContext, ConversationHandle, SkillCatalog};
use crate::cancel::CancelMap;
use crate::conversation::ConversationManager;
use crate::output::{Disposition, OutputContext, OutputHandler};
use crate::projection::TaskProjection;
use crate::service::TaskService;
use crate::ui::UiBus;

/// Shared services every runtime borrows from the kernel root.
pub struct RuntimeDeps {
    pub config: Arc<Config>,
    pub events: Arc<EventLog>,
    pub projection: Arc<TaskProjection>,
    pub service: Arc<TaskService>,
    pub conversation: Arc<ConversationManager>,
    pub handler: Arc<OutputHandler>,
    pub registry: Arc<ToolRegistry>,
    pub cancel_map: Arc<CancelMap>,
    pub ui: UiBus,
}

pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    llm: Arc<dyn LlmClient>,
    skills: Arc<dyn SkillCatalog>,
    deps: Arc<RuntimeDeps>,
    /// `task:<id>` keys of active loops. At most one loop per task.
    in_flight: Mutex<HashSet<String>>,
    /// `resume:<task>:<event>` dedup keys — a replayed response is a no-op.
    resume_seen: Mutex<HashSet<String>>,
    paused: Mutex<HashSet<TaskId>>,
    /// Tasks whose instructions arrived while a loop was already running.
    queued_instruction_tasks: Mutex<HashSet<TaskId>>,
}

impl AgentRuntime {
    pub fn new(
        agent: Arc<dyn Agent>,
        llm: Arc<dyn LlmClient>,
        skills: Arc<dyn SkillCatalog>,
        deps: Arc<RuntimeDeps>,
    ) -> Self {
        Self {
            agent,
            llm,
            skills,
            deps,
            in_flight: Mutex::new(HashSet::new()),
            resume_seen: Mutex::new(HashSet::new()),
            paused: Mutex::new(HashSet::new()),
            queued_instruction_tasks: Mutex::new(HashSet::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        self.agent.id()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Event dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Handle one domain event for a task owned by this agent. Called by
    /// the runtime manager's fan-out loop; never blocks — long work is
    /// spawned.
    pub fn on_event(self: &Arc<Self>, event: &StoredEvent) {
        let Some(task) = self.deps.projection.get_task(&event.stream_id) else {
            return;
        };
        if task.agent_id != self.agent.id() {
            return;
        }
        let task_id = event.stream_id.clone();

        match event.kind {
            EventKind::TaskCreated => self.spawn_execute(task_id),
            EventKind::TaskPaused => {
                self.paused.lock().insert(task_id.clone());
                self.deps.cancel_map.cancel(&task_id);
            }
            EventKind::TaskCanceled => {
                self.deps.cancel_map.cancel(&task_id);
                self.paused.lock().remove(&task_id);
                self.queued_instruction_tasks.lock().remove(&task_id);
            }
            EventKind::TaskCompleted | EventKind::TaskFailed => {
                self.paused.lock().remove(&task_id);
                self.queued_instruction_tasks.lock().remove(&task_id);
            }
            EventKind::TaskResumed => {
                self.paused.lock().remove(&task_id);
                self.spawn_execute(task_id);
            }
            EventKind::TaskInstructionAdded => self.on_instruction(event),
            EventKind::UserInteractionResponded => self.on_response(event),
            _ => {}
        }
    }

    fn on_instruction(self: &Arc<Self>, event: &StoredEvent) {
        let task_id = event.stream_id.clone();
        let Ok(payload) = event.payload_as::<InstructionPayload>() else {
            tracing::warn!(%task_id, "malformed instruction payload");
            return;
        };

        self.paused.lock().remove(&task_id);
        self.deps.conversation.queue_instruction(&task_id, payload.text);
        // Safe conversations take the instruction immediately; otherwise it
        // stays queued for the next boundary.
        if let Err(e) = self.deps.conversation.drain_instructions(&task_id) {
            tracing::warn!(%task_id, error = %e, "instruction drain failed");
        }

        match self.deps.projection.status(&task_id) {
            // The interaction response will re-drive the task.
            Some(TaskStatus::AwaitingUser) => (),
            _ => {
                if self.is_in_flight(&task_id) {
                    self.queued_instruction_tasks.lock().insert(task_id);
                } else {
                    self.spawn_execute(task_id);
                }
            }
        }
    }

    fn on_response(self: &Arc<Self>, event: &StoredEvent) {
        let task_id = event.stream_id.clone();
        let Ok(payload) = event.payload_as::<InteractionRespondedPayload>() else {
            tracing::warn!(%task_id, "malformed interaction response payload");
            return;
        };

        let dedup = format!("resume:{task_id}:{}", event.id);
        if !self.resume_seen.lock().insert(dedup) {
            return;
        }

        let key = flight_key(&task_id);
        let rt = self.clone();
        tokio::spawn(async move {
            // A response can land while the loop that requested it is still
            // tearing down; wait for the flight key instead of dropping the
            // response.
            while !rt.in_flight.lock().insert(key.clone()) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            rt.execute_loop(&task_id, Some(payload)).await;
            rt.in_flight.lock().remove(&key);
            rt.maybe_restart(&task_id);
        });
    }

    /// Start an execute loop unless one is already in flight for the task.
    pub fn spawn_execute(self: &Arc<Self>, task_id: TaskId) {
        let key = flight_key(&task_id);
        if !self.in_flight.lock().insert(key.clone()) {
            return;
        }
        let rt = self.clone();
        tokio::spawn(async move {
            rt.execute_loop(&task_id, None).await;
            rt.in_flight.lock().remove(&key);
            rt.maybe_restart(&task_id);
        });
    }

    fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight.lock().contains(&flight_key(task_id))
    }

    /// Instructions that raced with loop teardown get a fresh loop.
    fn maybe_restart(self: &Arc<Self>, task_id: &str) {
        let wants_restart = self.queued_instruction_tasks.lock().remove(task_id)
            || self.deps.conversation.has_queued(task_id);
        if !wants_restart {
            return;
        }
        if self.paused.lock().contains(task_id) {
            return;
        }
        match self.deps.projection.status(task_id) {
            Some(TaskStatus::InProgress) | Some(TaskStatus::Open) => {
                self.spawn_execute(task_id.to_owned());
            }
            _ => {}
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Loops
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Repeatedly run the inner loop until the task is terminal, awaiting
    /// user input, or paused with nothing queued.
    async fn execute_loop(
        self: &Arc<Self>,
        task_id: &str,
        mut pending: Option<InteractionRespondedPayload>,
    ) {
        loop {
            let Some(task) = self.deps.projection.get_task(task_id) else {
                tracing::warn!(%task_id, "execute loop for unknown task");
                return;
            };
            if task.status.is_terminal() {
                return;
            }

            if self.run_loop(task, pending.take()).await.is_err() {
                // The loop already appended TaskFailed; stop driving.
                return;
            }

            let Some(status) = self.deps.projection.status(task_id) else {
                return;
            };
            match status {
                TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled => return,
                TaskStatus::AwaitingUser => return,
                TaskStatus::Paused => {
                    if self.paused.lock().contains(task_id) {
                        return;
                    }
                    // An instruction woke the task; run again (the next
                    // loop entry resumes it).
                }
                TaskStatus::InProgress | TaskStatus::Open => {
                    let more = self.queued_instruction_tasks.lock().remove(task_id)
                        || self.deps.conversation.has_queued(task_id);
                    if !more {
                        return;
                    }
                }
            }
        }
    }

    /// One pass of the inner driver: load and repair history, reconcile
    /// status, drain instructions, then pull the agent's generator until it
    /// pauses, terminates, or yields control.
    async fn run_loop(
        self: &Arc<Self>,
        task: Task,
        pending: Option<InteractionRespondedPayload>,
    ) -> Result<()> {
        let task_id = task.task_id.clone();
        let span = tracing::info_span!("run_loop", %task_id, agent_id = %self.agent.id());

        let signal = self.deps.cancel_map.register(&task_id);

        // Approval binding: the confirmed ids authorize exactly the tool
        // call the original request named.
        let (confirmed_interaction_id, confirmed_tool_call_id) = match &pending {
            Some(response) if response.approved() => (
                Some(response.interaction_id.clone()),
                self.find_requested_tool_call(&task_id, &response.interaction_id),
            ),
            _ => (None, None),
        };

        let mut out_ctx = OutputContext {
            task_id: task_id.clone(),
            agent_id: self.agent.id().to_owned(),
            author_actor_id: format!("agent:{}", self.agent.id()),
            base_dir: self.deps.config.workspace.root.clone(),
            policy: self.deps.config.tools.policy,
            confirmed_interaction_id,
            confirmed_tool_call_id,
            signal: signal.clone(),
            streaming: self.deps.config.runtime.streaming,
        };

        let result = self
            .drive(&task, pending, &mut out_ctx)
            .instrument(span)
            .await;

        self.deps.cancel_map.remove(&task_id);

        if let Err(e) = &result {
            tracing::error!(%task_id, error = %e, "run loop failed");
            if let Err(fail_err) = self.deps.service.fail_task(&task_id, e.to_string()) {
                tracing::warn!(%task_id, error = %fail_err, "could not append TaskFailed");
            }
        }
        result
    }

    async fn drive(
        self: &Arc<Self>,
        task: &Task,
        pending: Option<InteractionRespondedPayload>,
        out_ctx: &mut OutputContext,
    ) -> Result<()> {
        let task_id = task.task_id.clone();
        let deps = &self.deps;

        let tool_ctx = out_ctx.tool_ctx();
        let rejection = pending.as_ref().filter(|p| !p.approved());
        deps.conversation
            .load_and_repair(&task_id, &tool_ctx, rejection)
            .await?;

        // Reconcile projected status with the fact that a loop is running:
        // fresh tasks start, instruction-woken paused tasks resume.
        match deps.projection.status(&task_id) {
            Some(TaskStatus::Open) => {
                deps.service.mark_started(&task_id)?;
            }
            Some(TaskStatus::Paused) if !self.paused.lock().contains(&task_id) => {
                deps.service.resume_task(&task_id)?;
            }
            _ => {}
        }

        deps.conversation.drain_instructions(&task_id)?;

        let agent_ctx = AgentContext {
            task_id: task_id.clone(),
            llm: self.llm.clone(),
            tools: deps.registry.clone(),
            skills: self.skills.clone(),
            base_dir: out_ctx.base_dir.clone(),
            history: ConversationHandle::new(deps.conversation.clone(), task_id.clone()),
            pending_response: pending,
            streaming: out_ctx.streaming,
            ui: deps.ui.clone(),
            signal: out_ctx.signal.clone(),
            max_loops: deps.config.runtime.max_agent_loops,
        };

        let mut outputs = self.agent.run(task.clone(), agent_ctx);
        loop {
            // Yield boundary: drain instructions and honor cancel/pause
            // before waking the generator — a paused task must not reach
            // the LLM again.
            deps.conversation.drain_instructions(&task_id)?;

            match deps.projection.status(&task_id) {
                Some(status) if status.is_terminal() => break,
                None => break,
                _ => {}
            }
            if self.paused.lock().contains(&task_id)
                && ConversationManager::safe_to_inject(&deps.conversation.history(&task_id))
            {
                break;
            }

            let Some(item) = outputs.next().await else {
                break;
            };
            let output = item?;

            match deps.handler.handle(output, out_ctx).await? {
                Disposition::Continue => {}
                Disposition::RequestInteraction(payload) => {
                    deps.service.request_interaction(&task_id, payload)?;
                    break;
                }
                Disposition::Completed { summary } => {
                    deps.service.complete_task(&task_id, summary)?;
                    break;
                }
                Disposition::Failed { reason } => {
                    deps.service.fail_task(&task_id, reason)?;
                    break;
                }
            }
        }
        // Dropping the stream releases whatever the producer holds.
        Ok(())
    }

    /// Look up the tool call a confirmation was bound to, from the original
    /// `UserInteractionRequested` event on the task's stream.
    fn find_requested_tool_call(&self, task_id: &str, interaction_id: &str) -> Option<String> {
        self.deps
            .events
            .read_stream(task_id, 1)
            .iter()
            .rev()
            .filter(|e| e.kind == EventKind::UserInteractionRequested)
            .find_map(|e| {
                let payload = e.payload_as::<InteractionRequestedPayload>().ok()?;
                (payload.interaction_id == interaction_id).then_some(payload.tool_call_id)
            })
    }
}

fn flight_key(task_id: &str) -> String {
    format!("task:{task_id}")
}
