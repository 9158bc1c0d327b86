//! Task projection — a deterministic, idempotent fold of the event log
//! into queryable task state plus the parent→children index.
//!
//! The fold is applied twice per event in the live system: synchronously by
//! the task service (so commands read their own writes) and again by the
//! runtime manager's fan-out loop before routing. The `last_event_id` guard
//! makes the second application a no-op.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use orchard_domain::event::{
    EventKind, InteractionRequestedPayload, StoredEvent, TaskCompletedPayload, TaskCreatedPayload,
    TaskFailedPayload, TaskId,
};
use orchard_domain::task::{transition, Task, TaskStatus, Transition};
use orchard_domain::Result;
use orchard_store::{EventLog, ProjectionStore};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectionState {
    tasks: HashMap<TaskId, Task>,
    children: HashMap<TaskId, Vec<TaskId>>,
    last_event_id: u64,
}

pub struct TaskProjection {
    state: RwLock<ProjectionState>,
}

impl TaskProjection {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ProjectionState::default()),
        }
    }

    /// Rebuild from the full event log.
    pub fn replay(&self, log: &EventLog) {
        for event in log.read_all(0) {
            self.apply(&event);
        }
    }

    /// Fold one event into the state. Idempotent: events at or below the
    /// high-water mark are skipped. Unknown kinds are no-ops.
    pub fn apply(&self, event: &StoredEvent) {
        let mut state = self.state.write();
        if event.id <= state.last_event_id {
            return;
        }
        state.last_event_id = event.id;

        if event.kind == EventKind::Unknown {
            return;
        }

        if event.kind == EventKind::TaskCreated {
            self.apply_created(&mut state, event);
            return;
        }

        let Some(task) = state.tasks.get_mut(&event.stream_id) else {
            tracing::warn!(stream_id = %event.stream_id, kind = %event.kind, "event for unknown task");
            return;
        };

        match transition(task.status, event.kind) {
            Transition::Rejected => {
                // The service never appends these; seeing one means the log
                // was produced by something else. Keep folding.
                tracing::warn!(
                    task_id = %task.task_id,
                    status = %task.status,
                    kind = %event.kind,
                    "rejected transition found in event log; ignoring"
                );
                return;
            }
            Transition::NoOp => {}
            Transition::To(next) => task.status = next,
        }
        task.updated_at = event.created_at;

        match event.kind {
            EventKind::TaskCompleted => {
                if let Ok(p) = event.payload_as::<TaskCompletedPayload>() {
                    task.summary = p.summary;
                }
            }
            EventKind::TaskFailed => {
                if let Ok(p) = event.payload_as::<TaskFailedPayload>() {
                    task.failure_reason = Some(p.reason);
                }
            }
            EventKind::UserInteractionRequested => {
                if let Ok(p) = event.payload_as::<InteractionRequestedPayload>() {
                    task.pending_interaction_id = Some(p.interaction_id);
                }
            }
            EventKind::UserInteractionResponded => {
                task.pending_interaction_id = None;
            }
            EventKind::TaskInstructionAdded => {
                // A reopened task sheds its previous outcome.
                if task.status == TaskStatus::InProgress {
                    task.summary = None;
                }
            }
            _ => {}
        }
    }

    fn apply_created(&self, state: &mut ProjectionState, event: &StoredEvent) {
        let payload: TaskCreatedPayload = match event.payload_as() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(stream_id = %event.stream_id, error = %e, "malformed TaskCreated payload");
                return;
            }
        };

        if state.tasks.contains_key(&event.stream_id) {
            tracing::warn!(stream_id = %event.stream_id, "duplicate TaskCreated; ignoring");
            return;
        }

        if let Some(parent) = &payload.parent_task_id {
            let children = state.children.entry(parent.clone()).or_default();
            children.push(event.stream_id.clone());
            if let Some(parent_task) = state.tasks.get_mut(parent) {
                parent_task.child_task_ids.push(event.stream_id.clone());
            }
        }

        state.tasks.insert(
            event.stream_id.clone(),
            Task {
                task_id: event.stream_id.clone(),
                title: payload.title,
                intent: payload.intent,
                priority: payload.priority,
                agent_id: payload.agent_id,
                parent_task_id: payload.parent_task_id,
                child_task_ids: Vec::new(),
                status: TaskStatus::Open,
                summary: None,
                failure_reason: None,
                pending_interaction_id: None,
                created_at: event.created_at,
                updated_at: event.created_at,
            },
        );
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.state.read().tasks.get(task_id).cloned()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.read().tasks.get(task_id).map(|t| t.status)
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self) -> Vec<Task> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        tasks
    }

    pub fn list_children(&self, task_id: &str) -> Vec<Task> {
        let state = self.state.read();
        state
            .children
            .get(task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Walk the parent chain upward. Returns the depth (a top-level task is
    /// depth 0) or `Error::Cycle` when an ancestor repeats.
    pub fn ancestor_depth(&self, task_id: &str) -> Result<usize> {
        let state = self.state.read();
        let mut visited = std::collections::HashSet::new();
        let mut current = task_id.to_owned();
        let mut depth = 0usize;

        while let Some(task) = state.tasks.get(&current) {
            if !visited.insert(current.clone()) {
                return Err(orchard_domain::Error::Cycle(current));
            }
            match &task.parent_task_id {
                Some(parent) => {
                    depth += 1;
                    current = parent.clone();
                }
                None => return Ok(depth),
            }
        }
        Ok(depth)
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn save_snapshot(&self, store: &ProjectionStore) -> Result<()> {
        let state = self.state.read();
        store.save("tasks", serde_json::to_value(&*state)?)
    }

    pub fn load_snapshot(&self, store: &ProjectionStore) -> bool {
        let Some(value) = store.load("tasks") else {
            return false;
        };
        match serde_json::from_value::<ProjectionState>(value) {
            Ok(loaded) => {
                *self.state.write() = loaded;
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "unreadable tasks snapshot; replaying from the log");
                false
            }
        }
    }

    pub fn last_event_id(&self) -> u64 {
        self.state.read().last_event_id
    }
}

impl Default for TaskProjection {
    fn default() -> Self {
        Self::new()
    }
}
