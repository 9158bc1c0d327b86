//! Agent output vocabulary — the typed yields the runtime pulls from an
//! agent's output sequence and hands to the output handler.

use serde::{Deserialize, Serialize};

use crate::message::ToolCallRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutput {
    /// User-visible assistant text.
    Text { content: String },
    /// Diagnostic chatter, shown only in verbose UIs.
    Verbose { content: String },
    /// A recoverable error the agent chose to surface without failing.
    Error { content: String },
    /// Reasoning/thinking content.
    Reasoning { content: String },
    /// A single tool invocation request.
    #[serde(rename_all = "camelCase")]
    ToolCall { call: ToolCallRequest },
    /// A batch of tool invocations in model order.
    #[serde(rename_all = "camelCase")]
    ToolCalls { calls: Vec<ToolCallRequest> },
    /// Terminal: the task succeeded.
    Done { summary: Option<String> },
    /// Terminal: the task failed.
    Failed { reason: String },
}

impl AgentOutput {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_outputs() {
        assert!(AgentOutput::Done { summary: None }.is_terminal());
        assert!(AgentOutput::Failed { reason: "x".into() }.is_terminal());
        assert!(!AgentOutput::Text { content: "hi".into() }.is_terminal());
    }

    #[test]
    fn tagged_serialization() {
        let out = AgentOutput::ToolCall {
            call: ToolCallRequest {
                tool_call_id: "tc1".into(),
                tool_name: "glob".into(),
                arguments: serde_json::json!({}),
            },
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["call"]["toolName"], "glob");
    }
}
