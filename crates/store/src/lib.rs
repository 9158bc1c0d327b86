//! Durable append-only stores backing the kernel: three JSONL logs
//! (events, conversations, audit) with an in-memory cache and hot
//! subscriptions, plus the atomically-replaced projection snapshot file.

pub mod jsonl;
pub mod logs;
pub mod snapshot;

pub use jsonl::{JsonlLog, Record};
pub use logs::{AuditLog, ConversationLog, EventLog, Logs};
pub use snapshot::ProjectionStore;
