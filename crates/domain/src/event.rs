//! Domain events — the append-only facts every other component is derived
//! from. Stored one JSON object per line in `events.jsonl`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskPriority;

/// Task ids double as event stream ids.
pub type TaskId = String;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    TaskCreated,
    TaskStarted,
    TaskPaused,
    TaskResumed,
    TaskCanceled,
    TaskCompleted,
    TaskFailed,
    TaskInstructionAdded,
    UserInteractionRequested,
    UserInteractionResponded,
    ArtifactChanged,
    /// Any tag this build does not know. Projections must treat these as
    /// no-ops so newer writers do not break older readers.
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// True for the events that end a task's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::TaskCompleted | Self::TaskFailed | Self::TaskCanceled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A persisted event. `id` is globally monotonic; `(stream_id, seq)` is
/// unique and dense starting at 1. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: u64,
    pub stream_id: TaskId,
    pub seq: u32,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Draft an event for a stream; the log assigns `id` and `seq` on append.
    pub fn draft(stream_id: impl Into<TaskId>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: 0,
            stream_id: stream_id.into(),
            seq: 0,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreatedPayload {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_actor_id: Option<String>,
}

/// Payload for pause / cancel events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasonPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_actor_id: Option<String>,
}

/// Confirmation request for one risky tool call. The `tool_call_id` binds
/// the eventual approval to exactly that invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRequestedPayload {
    pub interaction_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    pub prompt: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRespondedPayload {
    pub interaction_id: String,
    pub selected_option_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_value: Option<String>,
}

impl InteractionRespondedPayload {
    pub fn approved(&self) -> bool {
        self.selected_option_id == "approve"
    }
}
