//! The three concrete logs and the bundle that opens them together.

use std::path::Path;
use std::sync::Arc;

use orchard_domain::audit::AuditEntry;
use orchard_domain::event::StoredEvent;
use orchard_domain::message::StoredMessage;
use orchard_domain::Result;

use crate::jsonl::{JsonlLog, Record};
use crate::snapshot::ProjectionStore;

impl Record for StoredEvent {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn stream_key(&self) -> Option<&str> {
        Some(&self.stream_id)
    }
    fn seq(&self) -> u32 {
        self.seq
    }
    fn set_seq(&mut self, seq: u32) {
        self.seq = seq;
    }
}

impl Record for StoredMessage {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn stream_key(&self) -> Option<&str> {
        Some(&self.task_id)
    }
    fn seq(&self) -> u32 {
        self.index
    }
    fn set_seq(&mut self, seq: u32) {
        self.index = seq;
    }
}

// Audit entries are a flat global sequence — no per-stream seq.
impl Record for AuditEntry {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

pub type EventLog = JsonlLog<StoredEvent>;
pub type ConversationLog = JsonlLog<StoredMessage>;
pub type AuditLog = JsonlLog<AuditEntry>;

/// The full durable state of one workspace.
pub struct Logs {
    pub events: Arc<EventLog>,
    pub conversations: Arc<ConversationLog>,
    pub audit: Arc<AuditLog>,
    pub snapshots: Arc<ProjectionStore>,
}

impl Logs {
    /// Open (or create) every log under the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            events: Arc::new(EventLog::open(data_dir.join("events.jsonl"))?),
            conversations: Arc::new(ConversationLog::open(data_dir.join("conversations.jsonl"))?),
            audit: Arc::new(AuditLog::open(data_dir.join("audit.jsonl"))?),
            snapshots: Arc::new(ProjectionStore::new(data_dir.join("projections.jsonl"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchard_domain::audit::{AuditKind, AuditPayload};
    use orchard_domain::event::{EventKind, StoredEvent};
    use orchard_domain::message::{ChatMessage, StoredMessage};

    #[test]
    fn open_creates_all_files_on_first_append() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::open(dir.path()).unwrap();

        logs.events
            .append(vec![StoredEvent::draft(
                "t1",
                EventKind::TaskCreated,
                serde_json::json!({"title": "x", "agentId": "main"}),
            )])
            .unwrap();
        logs.conversations
            .append(vec![StoredMessage::draft("t1", ChatMessage::user("hi"))])
            .unwrap();
        logs.audit
            .append(vec![AuditEntry::draft(
                AuditKind::ToolCallRequested,
                AuditPayload {
                    task_id: "t1".into(),
                    tool_call_id: "tc1".into(),
                    tool_name: "glob".into(),
                    input: None,
                    output: None,
                    is_error: None,
                    duration_ms: None,
                    author_actor_id: "agent:main".into(),
                    timestamp: chrono::Utc::now(),
                },
            )])
            .unwrap();

        assert!(dir.path().join("events.jsonl").exists());
        assert!(dir.path().join("conversations.jsonl").exists());
        assert!(dir.path().join("audit.jsonl").exists());
    }

    #[test]
    fn event_seq_is_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::open(dir.path()).unwrap();

        let draft = |stream: &str| {
            StoredEvent::draft(stream, EventKind::TaskStarted, serde_json::Value::Null)
        };
        let stored = logs
            .events
            .append(vec![draft("a"), draft("b"), draft("a")])
            .unwrap();
        assert_eq!(stored[0].seq, 1);
        assert_eq!(stored[1].seq, 1);
        assert_eq!(stored[2].seq, 2);
    }

    #[test]
    fn message_index_is_dense_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::open(dir.path()).unwrap();

        for text in ["a", "b", "c"] {
            logs.conversations
                .append(vec![StoredMessage::draft("t1", ChatMessage::user(text))])
                .unwrap();
        }
        let msgs = logs.conversations.read_stream("t1", 1);
        let indexes: Vec<u32> = msgs.iter().map(|m| m.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test]
    fn audit_entries_have_no_stream_seq() {
        let dir = tempfile::tempdir().unwrap();
        let logs = Logs::open(dir.path()).unwrap();

        let entry = AuditEntry::draft(
            AuditKind::ToolCallRequested,
            AuditPayload {
                task_id: "t1".into(),
                tool_call_id: "tc1".into(),
                tool_name: "glob".into(),
                input: None,
                output: None,
                is_error: None,
                duration_ms: None,
                author_actor_id: "user".into(),
                timestamp: chrono::Utc::now(),
            },
        );
        let stored = logs.audit.append(vec![entry]).unwrap();
        assert_eq!(stored[0].id, 1);
        assert_eq!(stored[0].seq(), 0);
    }
}
