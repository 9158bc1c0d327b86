//! Task entity and its status machine.
//!
//! A task's status is never mutated directly: it is a deterministic fold of
//! the task's event stream through [`transition`]. The task service uses the
//! same function to validate commands before any event is written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventKind, TaskId};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status and priority
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    AwaitingUser,
    Paused,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::AwaitingUser => "awaiting_user",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Foreground,
    #[default]
    Normal,
    Background,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task entity (projected)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    pub priority: TaskPriority,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default)]
    pub child_task_ids: Vec<TaskId>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_interaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status transitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of applying an event kind to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Event accepted; the task moves to this status.
    To(TaskStatus),
    /// Event accepted; status unchanged. Instructions landing here while the
    /// task is awaiting user input or paused are queued for later drain.
    NoOp,
    /// Event rejected; the command fails and nothing is written.
    Rejected,
}

/// The status transition table. Exhaustive over every (status, kind) pair so
/// a new status or event kind forces a review here.
pub fn transition(status: TaskStatus, kind: EventKind) -> Transition {
    use EventKind as E;
    use TaskStatus as S;
    use Transition::{NoOp, Rejected, To};

    match (status, kind) {
        // Creation only ever targets a fresh stream; re-creating is invalid.
        (_, E::TaskCreated) => Rejected,

        (S::Open, E::TaskStarted) => To(S::InProgress),
        (S::Open, E::TaskCanceled) => To(S::Canceled),
        (S::Open, E::TaskInstructionAdded) => To(S::InProgress),
        (S::Open, _) => Rejected,

        (S::InProgress, E::TaskStarted) => NoOp,
        (S::InProgress, E::TaskPaused) => To(S::Paused),
        (S::InProgress, E::TaskCanceled) => To(S::Canceled),
        (S::InProgress, E::TaskCompleted) => To(S::Done),
        (S::InProgress, E::TaskFailed) => To(S::Failed),
        (S::InProgress, E::TaskInstructionAdded) => To(S::InProgress),
        (S::InProgress, E::UserInteractionRequested) => To(S::AwaitingUser),
        (S::InProgress, E::ArtifactChanged) => NoOp,
        (S::InProgress, _) => Rejected,

        (S::AwaitingUser, E::TaskStarted) => NoOp,
        (S::AwaitingUser, E::TaskPaused) => To(S::Paused),
        (S::AwaitingUser, E::TaskCanceled) => To(S::Canceled),
        (S::AwaitingUser, E::TaskInstructionAdded) => NoOp,
        (S::AwaitingUser, E::UserInteractionResponded) => To(S::InProgress),
        (S::AwaitingUser, E::ArtifactChanged) => NoOp,
        (S::AwaitingUser, _) => Rejected,

        (S::Paused, E::TaskResumed) => To(S::InProgress),
        (S::Paused, E::TaskCanceled) => To(S::Canceled),
        (S::Paused, E::TaskInstructionAdded) => NoOp,
        (S::Paused, E::ArtifactChanged) => NoOp,
        (S::Paused, _) => Rejected,

        // A done task can be reopened by a fresh instruction.
        (S::Done, E::TaskInstructionAdded) => To(S::InProgress),
        (S::Done, _) => Rejected,

        (S::Failed, _) | (S::Canceled, _) => Rejected,
    }
}
