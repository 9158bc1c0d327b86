//! Task service — the only component allowed to produce domain events.
//!
//! Every command reads the projected status, checks the transition table,
//! and either appends or fails with `InvalidTransition`. A command mutex
//! serializes validate+append so concurrent commands cannot interleave
//! between the read and the write.

use std::sync::Arc;

use parking_lot::Mutex;

use orchard_domain::event::{
    EventKind, InstructionPayload, InteractionRequestedPayload, InteractionRespondedPayload,
    ReasonPayload, StoredEvent, TaskCompletedPayload, TaskCreatedPayload, TaskFailedPayload, TaskId,
};
use orchard_domain::task::{transition, TaskPriority, TaskStatus, Transition};
use orchard_domain::{Error, Result};
use orchard_store::EventLog;

use crate::projection::TaskProjection;

pub struct CreateTaskParams {
    pub title: String,
    pub intent: Option<String>,
    pub priority: TaskPriority,
    pub agent_id: String,
    pub parent_task_id: Option<TaskId>,
    pub author_actor_id: String,
}

pub struct TaskService {
    log: Arc<EventLog>,
    projection: Arc<TaskProjection>,
    guard: Mutex<()>,
}

impl TaskService {
    pub fn new(log: Arc<EventLog>, projection: Arc<TaskProjection>) -> Self {
        Self {
            log,
            projection,
            guard: Mutex::new(()),
        }
    }

    // ── External commands ───────────────────────────────────────────

    pub fn create_task(&self, params: CreateTaskParams) -> Result<TaskId> {
        let _guard = self.guard.lock();

        if let Some(parent_id) = &params.parent_task_id {
            let parent = self
                .projection
                .get_task(parent_id)
                .ok_or_else(|| Error::NotFound(format!("parent task {parent_id}")))?;
            if parent.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    task_id: parent_id.clone(),
                    status: parent.status.to_string(),
                    event: "TaskCreated(child)".into(),
                });
            }
            // Walking the ancestor chain also rejects corrupted cycles.
            self.projection.ancestor_depth(parent_id)?;
        }

        let task_id = uuid::Uuid::new_v4().to_string();
        let payload = TaskCreatedPayload {
            title: params.title,
            intent: params.intent,
            priority: params.priority,
            agent_id: params.agent_id,
            parent_task_id: params.parent_task_id,
            author_actor_id: Some(params.author_actor_id),
        };
        self.append_unchecked(&task_id, EventKind::TaskCreated, serde_json::to_value(payload)?)?;
        Ok(task_id)
    }

    pub fn cancel_task(&self, task_id: &str, reason: Option<String>) -> Result<()> {
        self.emit(
            task_id,
            EventKind::TaskCanceled,
            serde_json::to_value(ReasonPayload { reason })?,
        )
        .map(drop)
    }

    pub fn pause_task(&self, task_id: &str, reason: Option<String>) -> Result<()> {
        self.emit(
            task_id,
            EventKind::TaskPaused,
            serde_json::to_value(ReasonPayload { reason })?,
        )
        .map(drop)
    }

    pub fn resume_task(&self, task_id: &str) -> Result<()> {
        self.emit(task_id, EventKind::TaskResumed, serde_json::Value::Null)
            .map(drop)
    }

    pub fn add_instruction(&self, task_id: &str, text: impl Into<String>) -> Result<()> {
        self.emit(
            task_id,
            EventKind::TaskInstructionAdded,
            serde_json::to_value(InstructionPayload {
                text: text.into(),
                author_actor_id: None,
            })?,
        )
        .map(drop)
    }

    pub fn respond_to_interaction(
        &self,
        task_id: &str,
        interaction_id: &str,
        reply: InteractionRespondedPayload,
    ) -> Result<()> {
        {
            let task = self
                .projection
                .get_task(task_id)
                .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
            if task.pending_interaction_id.as_deref() != Some(interaction_id) {
                return Err(Error::NotFound(format!(
                    "interaction {interaction_id} is not pending on task {task_id}"
                )));
            }
        }
        self.emit(
            task_id,
            EventKind::UserInteractionResponded,
            serde_json::to_value(reply)?,
        )
        .map(drop)
    }

    // ── Runtime-internal emitters ───────────────────────────────────

    pub fn mark_started(&self, task_id: &str) -> Result<Arc<StoredEvent>> {
        self.emit(task_id, EventKind::TaskStarted, serde_json::Value::Null)
    }

    pub fn complete_task(&self, task_id: &str, summary: Option<String>) -> Result<Arc<StoredEvent>> {
        self.emit(
            task_id,
            EventKind::TaskCompleted,
            serde_json::to_value(TaskCompletedPayload { summary })?,
        )
    }

    pub fn fail_task(&self, task_id: &str, reason: impl Into<String>) -> Result<Arc<StoredEvent>> {
        self.emit(
            task_id,
            EventKind::TaskFailed,
            serde_json::to_value(TaskFailedPayload {
                reason: reason.into(),
            })?,
        )
    }

    pub fn request_interaction(
        &self,
        task_id: &str,
        payload: InteractionRequestedPayload,
    ) -> Result<Arc<StoredEvent>> {
        self.emit(
            task_id,
            EventKind::UserInteractionRequested,
            serde_json::to_value(payload)?,
        )
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Validate against the transition table, then append and fold.
    fn emit(
        &self,
        task_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Arc<StoredEvent>> {
        let _guard = self.guard.lock();

        let status = self
            .projection
            .status(task_id)
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        if transition(status, kind) == Transition::Rejected {
            return Err(Error::InvalidTransition {
                task_id: task_id.to_owned(),
                status: status.to_string(),
                event: kind.to_string(),
            });
        }

        self.append_unchecked(task_id, kind, payload)
    }

    fn append_unchecked(
        &self,
        task_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<Arc<StoredEvent>> {
        let stored = self
            .log
            .append(vec![StoredEvent::draft(task_id, kind, payload)])?;
        let event = stored.into_iter().next().expect("append returned one record");
        // Fold immediately so the next command under this guard reads the
        // updated status. The manager's fan-out re-applies idempotently.
        self.projection.apply(&event);
        Ok(event)
    }

    /// Current projected status, for callers that tolerate missing tasks.
    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.projection.status(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<TaskService>, Arc<TaskProjection>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events.jsonl")).unwrap());
        let projection = Arc::new(TaskProjection::new());
        (
            Arc::new(TaskService::new(log, projection.clone())),
            projection,
            dir,
        )
    }

    fn params(agent: &str) -> CreateTaskParams {
        CreateTaskParams {
            title: "Echo".into(),
            intent: None,
            priority: TaskPriority::Normal,
            agent_id: agent.into(),
            parent_task_id: None,
            author_actor_id: "user".into(),
        }
    }

    #[test]
    fn create_then_lifecycle() {
        let (service, projection, _dir) = fixture();
        let id = service.create_task(params("main")).unwrap();
        assert_eq!(projection.status(&id), Some(TaskStatus::Open));

        service.mark_started(&id).unwrap();
        assert_eq!(projection.status(&id), Some(TaskStatus::InProgress));

        service.complete_task(&id, Some("ok".into())).unwrap();
        assert_eq!(projection.status(&id), Some(TaskStatus::Done));
        assert_eq!(projection.get_task(&id).unwrap().summary.as_deref(), Some("ok"));
    }

    #[test]
    fn invalid_transition_writes_nothing() {
        let (service, projection, _dir) = fixture();
        let id = service.create_task(params("main")).unwrap();

        let err = service.complete_task(&id, None).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(projection.status(&id), Some(TaskStatus::Open));
    }

    #[test]
    fn resume_requires_paused() {
        let (service, _projection, _dir) = fixture();
        let id = service.create_task(params("main")).unwrap();
        service.mark_started(&id).unwrap();

        assert!(service.resume_task(&id).is_err());
        service.pause_task(&id, None).unwrap();
        service.resume_task(&id).unwrap();
        assert_eq!(service.status(&id), Some(TaskStatus::InProgress));
    }

    #[test]
    fn unknown_task_is_not_found() {
        let (service, _projection, _dir) = fixture();
        assert!(matches!(
            service.cancel_task("ghost", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn child_requires_live_parent() {
        let (service, _projection, _dir) = fixture();
        let parent = service.create_task(params("main")).unwrap();
        service.mark_started(&parent).unwrap();

        let mut child_params = params("main");
        child_params.parent_task_id = Some(parent.clone());
        let child = service.create_task(child_params).unwrap();
        assert!(service.status(&child).is_some());

        service.cancel_task(&parent, None).unwrap();
        let mut late = params("main");
        late.parent_task_id = Some(parent);
        assert!(matches!(
            service.create_task(late),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn child_of_missing_parent_rejected() {
        let (service, _projection, _dir) = fixture();
        let mut p = params("main");
        p.parent_task_id = Some("ghost".into());
        assert!(matches!(service.create_task(p), Err(Error::NotFound(_))));
    }

    #[test]
    fn instruction_queued_while_awaiting_user() {
        let (service, projection, _dir) = fixture();
        let id = service.create_task(params("main")).unwrap();
        service.mark_started(&id).unwrap();
        service
            .request_interaction(
                &id,
                InteractionRequestedPayload {
                    interaction_id: "i1".into(),
                    tool_call_id: "tc1".into(),
                    tool_name: "runCommand".into(),
                    arguments: serde_json::json!({}),
                    prompt: "ok?".into(),
                    options: vec!["approve".into(), "reject".into()],
                },
            )
            .unwrap();
        assert_eq!(projection.status(&id), Some(TaskStatus::AwaitingUser));

        // Accepted at command level, status unchanged.
        service.add_instruction(&id, "also do this").unwrap();
        assert_eq!(projection.status(&id), Some(TaskStatus::AwaitingUser));
    }

    #[test]
    fn respond_checks_pending_interaction() {
        let (service, _projection, _dir) = fixture();
        let id = service.create_task(params("main")).unwrap();
        service.mark_started(&id).unwrap();

        let reply = InteractionRespondedPayload {
            interaction_id: "i1".into(),
            selected_option_id: "approve".into(),
            input_value: None,
        };
        // Nothing pending.
        assert!(service.respond_to_interaction(&id, "i1", reply.clone()).is_err());

        service
            .request_interaction(
                &id,
                InteractionRequestedPayload {
                    interaction_id: "i1".into(),
                    tool_call_id: "tc1".into(),
                    tool_name: "runCommand".into(),
                    arguments: serde_json::json!({}),
                    prompt: "ok?".into(),
                    options: vec!["approve".into(), "reject".into()],
                },
            )
            .unwrap();
        service.respond_to_interaction(&id, "i1", reply).unwrap();
        assert_eq!(service.status(&id), Some(TaskStatus::InProgress));
    }

    #[test]
    fn done_task_reopens_on_instruction() {
        let (service, _projection, _dir) = fixture();
        let id = service.create_task(params("main")).unwrap();
        service.mark_started(&id).unwrap();
        service.complete_task(&id, Some("done".into())).unwrap();

        service.add_instruction(&id, "one more thing").unwrap();
        assert_eq!(service.status(&id), Some(TaskStatus::InProgress));
    }

    #[test]
    fn canceled_task_rejects_everything() {
        let (service, _projection, _dir) = fixture();
        let id = service.create_task(params("main")).unwrap();
        service.cancel_task(&id, Some("nevermind".into())).unwrap();

        assert!(service.mark_started(&id).is_err());
        assert!(service.add_instruction(&id, "x").is_err());
        assert!(service.cancel_task(&id, None).is_err());
    }
}
