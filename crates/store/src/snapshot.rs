//! Projection snapshots — one JSON line per projection name in
//! `projections.jsonl`, replaced atomically (write-temp + rename).

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use orchard_domain::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotLine {
    name: String,
    state: serde_json::Value,
    saved_at: DateTime<Utc>,
}

pub struct ProjectionStore {
    path: PathBuf,
    // Serializes the read-modify-replace cycle.
    guard: Mutex<()>,
}

impl ProjectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Persist a named projection state, replacing any previous line for the
    /// same name. A vanished workspace directory (ENOENT) is swallowed: the
    /// cache stays authoritative and the next save retries from scratch.
    pub fn save(&self, name: &str, state: serde_json::Value) -> Result<()> {
        let _guard = self.guard.lock();

        let mut lines = self.load_all();
        lines.insert(
            name.to_owned(),
            SnapshotLine {
                name: name.to_owned(),
                state,
                saved_at: Utc::now(),
            },
        );

        let mut buf = String::new();
        for line in lines.values() {
            buf.push_str(&serde_json::to_string(line)?);
            buf.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        let write = std::fs::write(&tmp, buf).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = write {
            let _ = std::fs::remove_file(&tmp);
            if e.kind() == std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    "workspace gone while saving projection snapshot; dropping"
                );
                return Ok(());
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Load a named projection state, if present and parseable.
    pub fn load(&self, name: &str) -> Option<serde_json::Value> {
        self.load_all().remove(name).map(|line| line.state)
    }

    fn load_all(&self) -> BTreeMap<String, SnapshotLine> {
        let mut map = BTreeMap::new();
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return map;
        };
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SnapshotLine>(line) {
                Ok(snap) => {
                    map.insert(snap.name.clone(), snap);
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "skipping malformed projection snapshot line"
                    );
                }
            }
        }
        map
    }
}
