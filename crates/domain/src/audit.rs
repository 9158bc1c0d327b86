//! Audit entries — every tool invocation leaves a requested/completed pair
//! in `audit.jsonl`. Audit rows are never part of conversation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    ToolCallRequested,
    ToolCallCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPayload {
    pub task_id: TaskId,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub author_actor_id: String,
    pub timestamp: DateTime<Utc>,
}

/// One line of `audit.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub payload: AuditPayload,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn draft(kind: AuditKind, payload: AuditPayload) -> Self {
        Self {
            id: 0,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let entry = AuditEntry::draft(
            AuditKind::ToolCallRequested,
            AuditPayload {
                task_id: "t1".into(),
                tool_call_id: "tc1".into(),
                tool_name: "runCommand".into(),
                input: Some(serde_json::json!({"cmd": "ls"})),
                output: None,
                is_error: None,
                duration_ms: None,
                author_actor_id: "agent:main".into(),
                timestamp: Utc::now(),
            },
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "ToolCallRequested");
        assert_eq!(json["payload"]["toolCallId"], "tc1");
        assert_eq!(json["payload"]["authorActorId"], "agent:main");
        assert!(json["payload"].get("durationMs").is_none());
    }

    #[test]
    fn completed_carries_duration_and_error_flag() {
        let entry = AuditEntry::draft(
            AuditKind::ToolCallCompleted,
            AuditPayload {
                task_id: "t1".into(),
                tool_call_id: "tc1".into(),
                tool_name: "runCommand".into(),
                input: None,
                output: Some("done".into()),
                is_error: Some(false),
                duration_ms: Some(12),
                author_actor_id: "agent:main".into(),
                timestamp: Utc::now(),
            },
        );
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["payload"]["durationMs"], 12);
        assert_eq!(json["payload"]["isError"], false);
    }
}
