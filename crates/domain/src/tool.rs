//! Tool-facing value types shared between the registry, the executor, and
//! the conversation layer.

use serde::{Deserialize, Serialize};

/// Classification that decides whether a call needs a user confirmation
/// before it may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Risky,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolGroup {
    Filesystem,
    Execution,
    Orchestration,
    Web,
    Memory,
    Other,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// OpenAI function-call wire format.
    pub fn to_openai(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a tool invocation. Errors stay inside the conversation as
/// data; the model is the re-planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            is_error: true,
            error: Some(message.into()),
        }
    }

    /// The string persisted as the `role=tool` message content: the raw
    /// content for successes, the serialized result for errors so the model
    /// sees `{"isError":true,"error":…}`.
    pub fn message_content(&self) -> String {
        if self.is_error {
            serde_json::to_string(self).unwrap_or_else(|_| self.content.clone())
        } else {
            self.content.clone()
        }
    }
}
