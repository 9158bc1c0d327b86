//! The default agent: composes a system prompt from `AGENTS.md` and the
//! skill catalog, drives the LLM (completion or streaming), and loops until
//! the model stops calling tools.
//!
//! On entry it first re-yields any open tool calls left on the last
//! assistant message. That single rule covers both resume-after-approval
//! (the handler now holds the binding and executes) and crash-resume with a
//! dangling risky call (the handler re-issues the confirmation).

use async_stream::try_stream;
use futures_util::StreamExt;

use orchard_domain::agent::AgentOutput;
use orchard_domain::llm::ChatRequest;
use orchard_domain::message::{ChatMessage, MessagePart};
use orchard_domain::stream::Usage;
use orchard_domain::task::Task;
use orchard_domain::{Error, Result};

use crate::agent::{Agent, AgentContext, OutputStream};
use crate::streaming::StreamCollector;

const BASE_PROMPT: &str = "You are a task-focused agent. Work the task to completion, \
calling tools when they help, and finish with a concise summary.";

pub struct DefaultAgent {
    id: String,
    display_name: String,
}

impl DefaultAgent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: format!("agent {id}"),
            id,
        }
    }
}

impl Agent for DefaultAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn run(&self, task: Task, ctx: AgentContext) -> OutputStream {
        let llm = ctx.llm.clone();
        Box::pin(try_stream! {
            // Seed a fresh conversation.
            if ctx.history.snapshot().is_empty() {
                let system = compose_system_prompt(&ctx);
                ctx.history.persist(ChatMessage::system(system))?;
                let user_text = task
                    .intent
                    .clone()
                    .unwrap_or_else(|| task.title.clone());
                ctx.history.persist(ChatMessage::user(user_text))?;
            }

            let mut loops = 0u32;
            let mut total_usage = Usage::default();
            loop {
                loops += 1;
                if loops > ctx.max_loops {
                    yield AgentOutput::Failed {
                        reason: format!("agent loop limit reached ({} iterations)", ctx.max_loops),
                    };
                    return;
                }

                // Resume path: close the ledger before talking to the
                // model, one call at a time so each risky call meets the
                // confirmation gate on its own.
                let open = ctx.history.open_tool_calls();
                if let Some(call) = open.into_iter().next() {
                    yield AgentOutput::ToolCall { call };
                    continue;
                }

                let request = ChatRequest {
                    messages: ctx.history.snapshot(),
                    tools: ctx.tools.definitions(),
                    temperature: Some(0.2),
                    max_tokens: None,
                };

                let (text, reasoning, tool_calls, parts, usage) = if ctx.streaming {
                    let mut stream = llm.stream(request).await?;
                    let mut collector =
                        StreamCollector::new(ctx.task_id.clone(), ctx.ui.clone());
                    while let Some(event) = stream.next().await {
                        collector.on_event(event?);
                    }
                    let turn = collector.finish();
                    if let Some(message) = turn.error {
                        let failed: Result<()> = Err(Error::Llm(message));
                        failed?;
                    }
                    let reasoning = if turn.reasoning.is_empty() {
                        None
                    } else {
                        Some(turn.reasoning)
                    };
                    (turn.text, reasoning, turn.tool_calls, Some(turn.parts), turn.usage)
                } else {
                    let resp = llm.complete(request).await?;
                    (resp.content, resp.reasoning, resp.tool_calls, None, resp.usage)
                };
                if let Some(usage) = &usage {
                    total_usage.accumulate(usage);
                }

                // Persist the assistant turn with its true interleaving.
                let parts = parts.filter(|p: &Vec<MessagePart>| !p.is_empty());
                ctx.history.persist(ChatMessage::assistant_with_calls(
                    text.clone(),
                    tool_calls.clone(),
                    parts,
                ))?;

                if let Some(reasoning) = reasoning {
                    yield AgentOutput::Reasoning { content: reasoning };
                }
                if !text.is_empty() {
                    yield AgentOutput::Text { content: text.clone() };
                }

                if tool_calls.is_empty() {
                    tracing::debug!(
                        task_id = %ctx.task_id,
                        prompt_tokens = total_usage.prompt_tokens,
                        completion_tokens = total_usage.completion_tokens,
                        loops,
                        "run finished"
                    );
                    let summary = if text.is_empty() { None } else { Some(text) };
                    yield AgentOutput::Done { summary };
                    return;
                }

                if tool_calls.len() == 1 {
                    yield AgentOutput::ToolCall {
                        call: tool_calls.into_iter().next().expect("one call"),
                    };
                } else {
                    yield AgentOutput::ToolCalls { calls: tool_calls };
                }
            }
        })
    }
}

/// `AGENTS.md` (when present in the workspace) plus the skill index on top
/// of the base prompt.
fn compose_system_prompt(ctx: &AgentContext) -> String {
    let mut prompt = String::from(BASE_PROMPT);

    let agents_md = ctx.base_dir.join("AGENTS.md");
    match std::fs::read_to_string(&agents_md) {
        Ok(contents) if !contents.trim().is_empty() => {
            prompt.push_str("\n\n");
            prompt.push_str(contents.trim());
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %agents_md.display(), error = %e, "failed to read AGENTS.md");
        }
    }

    let skills = ctx.skills.render_index();
    if !skills.is_empty() {
        prompt.push_str("\n\n## Available skills\n");
        prompt.push_str(&skills);
    }

    prompt
}
