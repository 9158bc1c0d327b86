//! UI-only events — the `ui$` stream consumed by front-end adapters.
//!
//! These never land in a durable log; slow consumers buffer or drop, and
//! the kernel never retries a delivery.

use serde::Serialize;

use crate::audit::AuditEntry;
use crate::event::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    Verbose,
    Error,
    Reasoning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Text,
    Reasoning,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    #[serde(rename_all = "camelCase")]
    AgentOutput {
        task_id: TaskId,
        kind: OutputKind,
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    StreamDelta {
        task_id: TaskId,
        kind: StreamKind,
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    StreamEnd { task_id: TaskId },

    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        task_id: TaskId,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    #[serde(rename_all = "camelCase")]
    ToolCallHeartbeat {
        task_id: TaskId,
        tool_call_id: String,
        elapsed_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    ToolCallEnd {
        task_id: TaskId,
        tool_call_id: String,
        output: String,
        is_error: bool,
        duration_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    ToolCallsBatchStart {
        task_id: TaskId,
        safe_count: usize,
        risky_count: usize,
    },

    #[serde(rename_all = "camelCase")]
    ToolCallsBatchEnd { task_id: TaskId },

    #[serde(rename_all = "camelCase")]
    AuditEntry { entry: AuditEntry },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_tags() {
        let ev = UiEvent::ToolCallsBatchStart {
            task_id: "t1".into(),
            safe_count: 3,
            risky_count: 1,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_calls_batch_start");
        assert_eq!(json["safeCount"], 3);
        assert_eq!(json["riskyCount"], 1);
    }

    #[test]
    fn heartbeat_shape() {
        let ev = UiEvent::ToolCallHeartbeat {
            task_id: "t1".into(),
            tool_call_id: "tc1".into(),
            elapsed_ms: 4000,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_call_heartbeat");
        assert_eq!(json["elapsedMs"], 4000);
    }
}
