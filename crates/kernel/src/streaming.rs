//! Streaming adapter — turns provider stream events into UI deltas and
//! accumulates the interleaved `parts` array that becomes the persisted
//! assistant message, plus the assembled tool calls.

use std::collections::HashMap;

use serde_json::Value;

use orchard_domain::event::TaskId;
use orchard_domain::message::{MessagePart, ToolCallRequest};
use orchard_domain::stream::{StreamEvent, Usage};
use orchard_domain::ui::{StreamKind, UiEvent};

use crate::ui::UiBus;

/// Accumulated outcome of one streamed assistant turn.
#[derive(Debug, Default)]
pub struct StreamedTurn {
    pub text: String,
    pub reasoning: String,
    pub parts: Vec<MessagePart>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
    pub error: Option<String>,
}

pub struct StreamCollector {
    task_id: TaskId,
    ui: UiBus,
    turn: StreamedTurn,
    /// call_id → (tool_name, partial argument JSON) for providers that only
    /// send start+delta without a finish event.
    partial_calls: HashMap<String, (String, String)>,
    /// Preserves first-seen order for the partial-call flush.
    partial_order: Vec<String>,
}

impl StreamCollector {
    pub fn new(task_id: TaskId, ui: UiBus) -> Self {
        Self {
            task_id,
            ui,
            turn: StreamedTurn::default(),
            partial_calls: HashMap::new(),
            partial_order: Vec::new(),
        }
    }

    /// Feed one provider event: emits the matching UI delta and folds the
    /// event into text/reasoning/parts/tool-call state.
    pub fn on_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Reasoning { text } => {
                self.ui.send(UiEvent::StreamDelta {
                    task_id: self.task_id.clone(),
                    kind: StreamKind::Reasoning,
                    content: text.clone(),
                });
                self.turn.reasoning.push_str(&text);
                self.push_part(MessagePart::Reasoning { text });
            }
            StreamEvent::Token { text } => {
                self.ui.send(UiEvent::StreamDelta {
                    task_id: self.task_id.clone(),
                    kind: StreamKind::Text,
                    content: text.clone(),
                });
                self.turn.text.push_str(&text);
                self.push_part(MessagePart::Text { text });
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                self.push_part(MessagePart::ToolCall {
                    tool_call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                });
                if !self.partial_calls.contains_key(&call_id) {
                    self.partial_order.push(call_id.clone());
                }
                self.partial_calls.insert(call_id, (tool_name, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, args)) = self.partial_calls.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                self.partial_calls.remove(&call_id);
                self.partial_order.retain(|id| id != &call_id);
                self.turn.tool_calls.push(ToolCallRequest {
                    tool_call_id: call_id,
                    tool_name,
                    arguments,
                });
            }
            StreamEvent::Done { usage, .. } => {
                self.turn.usage = usage;
                self.ui.send(UiEvent::StreamEnd {
                    task_id: self.task_id.clone(),
                });
            }
            StreamEvent::Error { message } => {
                self.turn.error = Some(message);
            }
        }
    }

    /// Consecutive same-kind chunks merge into one part.
    fn push_part(&mut self, part: MessagePart) {
        match (self.turn.parts.last_mut(), &part) {
            (Some(MessagePart::Text { text }), MessagePart::Text { text: more }) => {
                text.push_str(more);
            }
            (Some(MessagePart::Reasoning { text }), MessagePart::Reasoning { text: more }) => {
                text.push_str(more);
            }
            _ => self.turn.parts.push(part),
        }
    }

    /// Finish the turn, assembling any calls that came through start/delta
    /// but never saw a finish event (some providers only send deltas).
    pub fn finish(mut self) -> StreamedTurn {
        for call_id in std::mem::take(&mut self.partial_order) {
            let Some((tool_name, args)) = self.partial_calls.remove(&call_id) else {
                continue;
            };
            let arguments = if args.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                match serde_json::from_str(&args) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %call_id,
                            tool = %tool_name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    }
                }
            };
            self.turn.tool_calls.push(ToolCallRequest {
                tool_call_id: call_id,
                tool_name,
                arguments,
            });
        }
        self.turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (StreamCollector, tokio::sync::broadcast::Receiver<UiEvent>) {
        let ui = UiBus::new();
        let rx = ui.subscribe();
        (StreamCollector::new("t1".into(), ui), rx)
    }

    #[tokio::test]
    async fn merges_consecutive_same_kind_chunks() {
        let (mut c, _rx) = collector();
        c.on_event(StreamEvent::Reasoning { text: "let ".into() });
        c.on_event(StreamEvent::Reasoning { text: "me think".into() });
        c.on_event(StreamEvent::Token { text: "hel".into() });
        c.on_event(StreamEvent::Token { text: "lo".into() });
        c.on_event(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        });

        let turn = c.finish();
        assert_eq!(turn.text, "hello");
        assert_eq!(turn.reasoning, "let me think");
        assert_eq!(
            turn.parts,
            vec![
                MessagePart::Reasoning {
                    text: "let me think".into()
                },
                MessagePart::Text {
                    text: "hello".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn interleaving_is_preserved() {
        let (mut c, _rx) = collector();
        c.on_event(StreamEvent::Token { text: "before".into() });
        c.on_event(StreamEvent::ToolCallStarted {
            call_id: "tc1".into(),
            tool_name: "glob".into(),
        });
        c.on_event(StreamEvent::ToolCallFinished {
            call_id: "tc1".into(),
            tool_name: "glob".into(),
            arguments: serde_json::json!({"pattern": "*"}),
        });
        c.on_event(StreamEvent::Token { text: "after".into() });

        let turn = c.finish();
        assert_eq!(turn.parts.len(), 3);
        assert!(matches!(turn.parts[1], MessagePart::ToolCall { .. }));
        assert_eq!(turn.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn start_delta_only_calls_are_flushed() {
        let (mut c, _rx) = collector();
        c.on_event(StreamEvent::ToolCallStarted {
            call_id: "tc1".into(),
            tool_name: "grep".into(),
        });
        c.on_event(StreamEvent::ToolCallDelta {
            call_id: "tc1".into(),
            delta: "{\"pattern\":".into(),
        });
        c.on_event(StreamEvent::ToolCallDelta {
            call_id: "tc1".into(),
            delta: "\"x\"}".into(),
        });

        let turn = c.finish();
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(
            turn.tool_calls[0].arguments,
            serde_json::json!({"pattern": "x"})
        );
    }

    #[tokio::test]
    async fn malformed_partial_arguments_default_to_empty_object() {
        let (mut c, _rx) = collector();
        c.on_event(StreamEvent::ToolCallStarted {
            call_id: "tc1".into(),
            tool_name: "grep".into(),
        });
        c.on_event(StreamEvent::ToolCallDelta {
            call_id: "tc1".into(),
            delta: "{broken".into(),
        });

        let turn = c.finish();
        assert_eq!(turn.tool_calls[0].arguments, serde_json::json!({}));
    }

    #[tokio::test]
    async fn emits_deltas_and_stream_end() {
        let (mut c, mut rx) = collector();
        c.on_event(StreamEvent::Token { text: "hi".into() });
        c.on_event(StreamEvent::Done {
            usage: None,
            finish_reason: None,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            UiEvent::StreamDelta {
                kind: StreamKind::Text,
                ..
            }
        ));
        assert!(matches!(rx.recv().await.unwrap(), UiEvent::StreamEnd { .. }));
    }
}
