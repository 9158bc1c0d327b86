//! Conversation manager — keeps persisted history structurally valid after
//! crashes and pauses, and decides when it is safe to inject user
//! instructions.
//!
//! Structural invariant: every tool call an assistant message carries must
//! eventually be closed by exactly one `role=tool` result with the same id.
//! Risky calls may stay open while a confirmation is pending; safe calls
//! are re-executed on load so the model never sees a half-finished ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use orchard_domain::event::{InteractionRespondedPayload, TaskId};
use orchard_domain::message::{ChatMessage, Role, StoredMessage, ToolCallRequest};
use orchard_domain::tool::{RiskLevel, ToolResult};
use orchard_domain::Result;
use orchard_store::ConversationLog;
use orchard_tools::{ToolContext, ToolExecutor};

pub struct ConversationManager {
    log: Arc<ConversationLog>,
    executor: Arc<ToolExecutor>,
    /// Per-task queued instructions, drained in arrival order once safe.
    queues: Mutex<HashMap<TaskId, VecDeque<String>>>,
    /// Serializes check+append so idempotent writes stay idempotent under
    /// concurrent sources (catch-up + live subscription).
    append_guard: Mutex<()>,
}

impl ConversationManager {
    pub fn new(log: Arc<ConversationLog>, executor: Arc<ToolExecutor>) -> Self {
        Self {
            log,
            executor,
            queues: Mutex::new(HashMap::new()),
            append_guard: Mutex::new(()),
        }
    }

    // ── History access ──────────────────────────────────────────────

    pub fn history(&self, task_id: &str) -> Vec<ChatMessage> {
        self.log
            .read_stream(task_id, 1)
            .iter()
            .map(|m| m.message.clone())
            .collect()
    }

    pub fn persist(&self, task_id: &str, message: ChatMessage) -> Result<Arc<StoredMessage>> {
        let stored = self
            .log
            .append(vec![StoredMessage::draft(task_id, message)])?;
        Ok(stored.into_iter().next().expect("append returned one record"))
    }

    /// Append a tool result unless one for this `tool_call_id` already
    /// exists. Returns true when a new message was written.
    pub fn persist_tool_result_if_missing(
        &self,
        task_id: &str,
        call: &ToolCallRequest,
        result: &ToolResult,
    ) -> Result<bool> {
        let _guard = self.append_guard.lock();
        let exists = self.log.read_stream(task_id, 1).iter().any(|m| {
            m.message.role == Role::Tool
                && m.message.tool_call_id.as_deref() == Some(call.tool_call_id.as_str())
        });
        if exists {
            return Ok(false);
        }
        self.log.append(vec![StoredMessage::draft(
            task_id,
            ChatMessage::tool_result(&call.tool_call_id, &call.tool_name, result.message_content()),
        )])?;
        Ok(true)
    }

    // ── Structural predicates ───────────────────────────────────────

    /// Tool calls of the last assistant message that have no `role=tool`
    /// result yet, in their original order.
    pub fn open_tool_calls(history: &[ChatMessage]) -> Vec<ToolCallRequest> {
        let Some(pos) = history
            .iter()
            .rposition(|m| m.role == Role::Assistant && !m.calls().is_empty())
        else {
            return Vec::new();
        };

        let closed: HashSet<&str> = history[pos + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        history[pos]
            .calls()
            .iter()
            .filter(|c| !closed.contains(c.tool_call_id.as_str()))
            .cloned()
            .collect()
    }

    /// True iff adding a `role=user` message now would not break the
    /// call/result pairing: the last assistant message carrying tool calls
    /// has all of them closed.
    pub fn safe_to_inject(history: &[ChatMessage]) -> bool {
        Self::open_tool_calls(history).is_empty()
    }

    // ── Load and repair ─────────────────────────────────────────────

    /// Load persisted history and bring it back to a coherent state:
    ///
    /// 1. Safe dangling calls are re-executed through the executor and their
    ///    real results appended (even an error result closes the ledger).
    /// 2. Risky or unknown dangling calls are left open — the caller either
    ///    re-issues the confirmation or processes a rejection.
    /// 3. When the pending interaction response is a rejection, every
    ///    remaining dangling call receives the synthetic rejection result.
    pub async fn load_and_repair(
        &self,
        task_id: &str,
        ctx: &ToolContext,
        pending: Option<&InteractionRespondedPayload>,
    ) -> Result<Vec<ChatMessage>> {
        let history = self.history(task_id);
        let open = Self::open_tool_calls(&history);
        if open.is_empty() {
            return Ok(history);
        }

        for call in &open {
            if self.executor.risk_of(call, ctx) == RiskLevel::Safe
                && self.executor.registry().get(&call.tool_name).is_some()
            {
                tracing::info!(
                    task_id,
                    tool_call_id = %call.tool_call_id,
                    tool_name = %call.tool_name,
                    "re-executing dangling safe tool call"
                );
                let result = self.executor.execute(call, ctx).await?;
                self.persist_tool_result_if_missing(task_id, call, &result)?;
            }
        }

        if let Some(response) = pending {
            if !response.approved() {
                let history = self.history(task_id);
                for call in Self::open_tool_calls(&history) {
                    let result = self.executor.record_rejection(&call, ctx)?;
                    self.persist_tool_result_if_missing(task_id, &call, &result)?;
                }
            }
        }

        Ok(self.history(task_id))
    }

    // ── Instruction queue ───────────────────────────────────────────

    pub fn queue_instruction(&self, task_id: &str, text: impl Into<String>) {
        self.queues
            .lock()
            .entry(task_id.to_owned())
            .or_default()
            .push_back(text.into());
    }

    pub fn has_queued(&self, task_id: &str) -> bool {
        self.queues
            .lock()
            .get(task_id)
            .is_some_and(|q| !q.is_empty())
    }

    /// Append queued instructions as `role=user` messages in arrival order,
    /// provided the conversation is safe to inject. Returns how many were
    /// drained (0 when unsafe or empty).
    pub fn drain_instructions(&self, task_id: &str) -> Result<usize> {
        let pending: Vec<String> = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(task_id) else {
                return Ok(0);
            };
            if queue.is_empty() {
                return Ok(0);
            }
            if !Self::safe_to_inject(&self.history(task_id)) {
                return Ok(0);
            }
            queue.drain(..).collect()
        };

        let count = pending.len();
        for text in pending {
            self.persist(task_id, ChatMessage::user(text))?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tools_fixture, RISKY_TOOL, SAFE_TOOL};
    use orchard_domain::message::MessagePart;

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest {
            tool_call_id: id.into(),
            tool_name: name.into(),
            arguments: serde_json::json!({"value": id}),
        }
    }

    fn manager() -> (Arc<ConversationManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _registry) = tools_fixture(dir.path());
        let log = Arc::new(ConversationLog::open(dir.path().join("conversations.jsonl")).unwrap());
        (Arc::new(ConversationManager::new(log, executor)), dir)
    }

    #[test]
    fn safe_to_inject_on_empty_and_closed_histories() {
        assert!(ConversationManager::safe_to_inject(&[]));

        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_calls("", vec![call("tc1", SAFE_TOOL)], None),
            ChatMessage::tool_result("tc1", SAFE_TOOL, "done"),
        ];
        assert!(ConversationManager::safe_to_inject(&history));
    }

    #[test]
    fn open_calls_detected() {
        let history = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_calls(
                "",
                vec![call("tc1", SAFE_TOOL), call("tc2", RISKY_TOOL)],
                None,
            ),
            ChatMessage::tool_result("tc1", SAFE_TOOL, "done"),
        ];
        let open = ConversationManager::open_tool_calls(&history);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].tool_call_id, "tc2");
        assert!(!ConversationManager::safe_to_inject(&history));
    }

    #[test]
    fn plain_assistant_is_safe() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        assert!(ConversationManager::safe_to_inject(&history));
    }

    #[tokio::test]
    async fn repair_reexecutes_safe_dangling_call() {
        let (manager, _dir) = manager();
        manager
            .persist(
                "t1",
                ChatMessage::assistant_with_calls("", vec![call("tc9", SAFE_TOOL)], None),
            )
            .unwrap();

        let ctx = ToolContext::for_task("t1", "main");
        let history = manager.load_and_repair("t1", &ctx, None).await.unwrap();

        let last = history.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.tool_call_id.as_deref(), Some("tc9"));
        // A real result, not a synthetic "interrupted" marker.
        assert!(last.text().contains("tc9"));
        assert!(ConversationManager::safe_to_inject(&history));
    }

    #[tokio::test]
    async fn repair_leaves_risky_dangling() {
        let (manager, _dir) = manager();
        manager
            .persist(
                "t1",
                ChatMessage::assistant_with_calls("", vec![call("tc1", RISKY_TOOL)], None),
            )
            .unwrap();

        let ctx = ToolContext::for_task("t1", "main");
        let history = manager.load_and_repair("t1", &ctx, None).await.unwrap();

        assert_eq!(ConversationManager::open_tool_calls(&history).len(), 1);
    }

    #[tokio::test]
    async fn rejection_closes_dangling_risky_call() {
        let (manager, _dir) = manager();
        manager
            .persist(
                "t1",
                ChatMessage::assistant_with_calls("", vec![call("tc1", RISKY_TOOL)], None),
            )
            .unwrap();

        let ctx = ToolContext::for_task("t1", "main");
        let reply = InteractionRespondedPayload {
            interaction_id: "i1".into(),
            selected_option_id: "reject".into(),
            input_value: None,
        };
        let history = manager
            .load_and_repair("t1", &ctx, Some(&reply))
            .await
            .unwrap();

        let last = history.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert!(last.text().contains("User rejected the request"));
        assert!(ConversationManager::safe_to_inject(&history));
    }

    #[tokio::test]
    async fn approval_does_not_close_risky_call() {
        let (manager, _dir) = manager();
        manager
            .persist(
                "t1",
                ChatMessage::assistant_with_calls("", vec![call("tc1", RISKY_TOOL)], None),
            )
            .unwrap();

        let ctx = ToolContext::for_task("t1", "main");
        let reply = InteractionRespondedPayload {
            interaction_id: "i1".into(),
            selected_option_id: "approve".into(),
            input_value: None,
        };
        let history = manager
            .load_and_repair("t1", &ctx, Some(&reply))
            .await
            .unwrap();

        // The approved call is executed by the output handler, not here.
        assert_eq!(ConversationManager::open_tool_calls(&history).len(), 1);
    }

    #[test]
    fn tool_result_append_is_idempotent() {
        let (manager, _dir) = manager();
        let c = call("tc1", SAFE_TOOL);
        let result = ToolResult::ok("out");

        assert!(manager
            .persist_tool_result_if_missing("t1", &c, &result)
            .unwrap());
        assert!(!manager
            .persist_tool_result_if_missing("t1", &c, &result)
            .unwrap());
        assert_eq!(manager.history("t1").len(), 1);
    }

    #[test]
    fn instructions_drain_in_arrival_order_once_safe() {
        let (manager, _dir) = manager();
        manager
            .persist(
                "t1",
                ChatMessage::assistant_with_calls("", vec![call("tc1", SAFE_TOOL)], None),
            )
            .unwrap();

        manager.queue_instruction("t1", "first");
        manager.queue_instruction("t1", "second");

        // Unsafe: nothing drains.
        assert_eq!(manager.drain_instructions("t1").unwrap(), 0);
        assert!(manager.has_queued("t1"));

        manager
            .persist("t1", ChatMessage::tool_result("tc1", SAFE_TOOL, "done"))
            .unwrap();

        assert_eq!(manager.drain_instructions("t1").unwrap(), 2);
        assert!(!manager.has_queued("t1"));

        let history = manager.history("t1");
        let users: Vec<&str> = history
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text())
            .collect();
        assert_eq!(users, vec!["first", "second"]);

        // Draining again is a no-op.
        assert_eq!(manager.drain_instructions("t1").unwrap(), 0);
    }

    #[test]
    fn parts_survive_persistence() {
        let (manager, _dir) = manager();
        let message = ChatMessage::assistant_with_calls(
            "thinking done",
            vec![call("tc1", SAFE_TOOL)],
            Some(vec![
                MessagePart::Reasoning { text: "hmm".into() },
                MessagePart::Text {
                    text: "thinking done".into(),
                },
                MessagePart::ToolCall {
                    tool_call_id: "tc1".into(),
                    tool_name: SAFE_TOOL.into(),
                },
            ]),
        );
        manager.persist("t1", message).unwrap();

        let history = manager.history("t1");
        let parts = history[0].parts.as_ref().unwrap();
        assert_eq!(parts.len(), 3);
    }
}
