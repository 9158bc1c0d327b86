//! Per-task cancellation tokens with group fan-out.
//!
//! Each running loop gets a `CancellationToken` that fires when the task is
//! paused or canceled. **Groups** support cascading cancellation: children
//! created by the subtask bridge register in the parent's group, so
//! canceling the parent signals every child's token too.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use orchard_domain::event::TaskId;

pub struct CancelMap {
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    /// parent task → set of child task ids.
    groups: Mutex<HashMap<TaskId, HashSet<TaskId>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Create and register a fresh token for a task's run.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(task_id.to_owned(), token.clone());
        token
    }

    /// Signal a task's token, cascading to every child in its group.
    /// Returns true if a token was registered for the task itself.
    pub fn cancel(&self, task_id: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(task_id) {
            token.cancel();
            true
        } else {
            false
        };

        if let Some(children) = self.groups.lock().get(task_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }

        found
    }

    /// Remove a task's token and any group it owned (run finished).
    pub fn remove(&self, task_id: &str) {
        self.tokens.lock().remove(task_id);
        self.groups.lock().remove(task_id);
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.tokens.lock().contains_key(task_id)
    }

    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .entry(parent.to_owned())
            .or_default()
            .insert(child.to_owned());
    }

    pub fn remove_from_group(&self, parent: &str, child: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                groups.remove(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_cancel() {
        let map = CancelMap::new();
        let token = map.register("t1");
        assert!(!token.is_cancelled());
        assert!(map.is_running("t1"));

        assert!(map.cancel("t1"));
        assert!(token.is_cancelled());

        map.remove("t1");
        assert!(!map.is_running("t1"));
        assert!(!map.cancel("t1"));
    }

    #[test]
    fn cancel_cascades_to_group_children() {
        let map = CancelMap::new();
        let parent = map.register("p");
        let child1 = map.register("c1");
        let child2 = map.register("c2");
        map.add_to_group("p", "c1");
        map.add_to_group("p", "c2");

        map.cancel("p");
        assert!(parent.is_cancelled());
        assert!(child1.is_cancelled());
        assert!(child2.is_cancelled());
    }

    #[test]
    fn removed_child_escapes_cascade() {
        let map = CancelMap::new();
        let _parent = map.register("p");
        let child = map.register("c");
        map.add_to_group("p", "c");
        map.remove_from_group("p", "c");

        map.cancel("p");
        assert!(!child.is_cancelled());
    }

    #[test]
    fn register_replaces_previous_token() {
        let map = CancelMap::new();
        let old = map.register("t1");
        let new = map.register("t1");

        map.cancel("t1");
        assert!(new.is_cancelled());
        assert!(!old.is_cancelled());
    }

    #[tokio::test]
    async fn token_is_awaitable() {
        let map = CancelMap::new();
        let token = map.register("t1");
        let waiter = tokio::spawn(async move { token.cancelled().await });
        map.cancel("t1");
        waiter.await.unwrap();
    }
}
