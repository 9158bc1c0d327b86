//! The LLM port. Provider-specific HTTP plumbing lives outside the kernel;
//! only this completion/streaming contract matters here.

use crate::error::Result;
use crate::message::{ChatMessage, ToolCallRequest};
use crate::stream::{BoxStream, StreamEvent, Usage};
use crate::tool::ToolDefinition;

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<ChatMessage>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Textual content of the response.
    pub content: String,
    /// Reasoning content, when the model exposes it.
    pub reasoning: Option<String>,
    /// Tool calls emitted by the model.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Token usage information.
    pub usage: Option<Usage>,
}

/// Trait every LLM adapter must implement.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn complete(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// Send a chat completion request and return a stream of events.
    async fn stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}
