//! Generic append-only JSONL log with an in-memory cache and hot
//! subscriptions.
//!
//! Write path: ids and per-stream seqs are assigned under the append mutex,
//! the serialized lines hit the file first, and only then does the cache
//! mutate — a failed write rolls the counters back so nothing half-exists.
//! Subscribers are notified after the mutex is released; each subscriber
//! owns an unbounded queue, so a slow handler lags but never loses records.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use orchard_domain::Result;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

/// A record a [`JsonlLog`] can store. Ids are assigned by the log; records
/// belonging to a stream also receive a dense 1-based per-stream seq.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);

    /// The stream this record belongs to, if the log is stream-partitioned.
    fn stream_key(&self) -> Option<&str> {
        None
    }
    fn seq(&self) -> u32 {
        0
    }
    fn set_seq(&mut self, _seq: u32) {}
}

struct LogInner<T> {
    records: Vec<Arc<T>>,
    next_id: u64,
    stream_seqs: HashMap<String, u32>,
}

pub struct JsonlLog<T: Record> {
    path: PathBuf,
    inner: Mutex<LogInner<T>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<T>>>>,
}

impl<T: Record> JsonlLog<T> {
    /// Open (or create) a log file, loading every parseable line into the
    /// cache. Corrupted lines are logged and skipped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut records: Vec<Arc<T>> = Vec::new();
        let mut next_id: u64 = 1;
        let mut stream_seqs: HashMap<String, u32> = HashMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for (line_no, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(line) {
                    Ok(record) => {
                        next_id = next_id.max(record.id() + 1);
                        if let Some(key) = record.stream_key() {
                            let seq = stream_seqs.entry(key.to_owned()).or_insert(0);
                            *seq = (*seq).max(record.seq());
                        }
                        records.push(Arc::new(record));
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "skipping malformed log line"
                        );
                    }
                }
            }
        }

        Ok(Self {
            path,
            inner: Mutex::new(LogInner {
                records,
                next_id,
                stream_seqs,
            }),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Append records atomically. Assigns monotonic ids (and per-stream
    /// seqs), writes the serialized lines before touching the cache, and
    /// rolls the counters back on write failure. Returns the stored records
    /// and notifies every subscriber, in append order, after the append
    /// mutex is released.
    pub fn append(&self, drafts: Vec<T>) -> Result<Vec<Arc<T>>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let stored: Vec<Arc<T>>;
        {
            let mut inner = self.inner.lock();

            // Assign ids/seqs on locals so a failed write leaves the
            // counters untouched.
            let mut next_id = inner.next_id;
            let mut seqs = inner.stream_seqs.clone();
            let mut assigned = Vec::with_capacity(drafts.len());
            let mut buf = String::new();

            for mut draft in drafts {
                draft.set_id(next_id);
                next_id += 1;
                if let Some(key) = draft.stream_key().map(str::to_owned) {
                    let seq = seqs.entry(key).or_insert(0);
                    *seq += 1;
                    draft.set_seq(*seq);
                }
                buf.push_str(&serde_json::to_string(&draft)?);
                buf.push('\n');
                assigned.push(Arc::new(draft));
            }

            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(buf.as_bytes())?;

            // Durable; commit the counters and the cache.
            inner.next_id = next_id;
            inner.stream_seqs = seqs;
            inner.records.extend(assigned.iter().cloned());
            stored = assigned;
        }

        // Emission happens outside the mutex to avoid reentrancy deadlocks.
        self.emit(&stored);
        Ok(stored)
    }

    fn emit(&self, stored: &[Arc<T>]) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| {
            for record in stored {
                if tx.send(record.clone()).is_err() {
                    return false;
                }
            }
            true
        });
    }

    /// Every record with `id > from_id_exclusive`, in append order.
    pub fn read_all(&self, from_id_exclusive: u64) -> Vec<Arc<T>> {
        let inner = self.inner.lock();
        let start = inner
            .records
            .partition_point(|r| r.id() <= from_id_exclusive);
        inner.records[start..].to_vec()
    }

    /// Records of one stream with `seq >= from_seq`, in seq order.
    pub fn read_stream(&self, stream: &str, from_seq: u32) -> Vec<Arc<T>> {
        let inner = self.inner.lock();
        inner
            .records
            .iter()
            .filter(|r| r.stream_key() == Some(stream) && r.seq() >= from_seq)
            .cloned()
            .collect()
    }

    pub fn read_by_id(&self, id: u64) -> Option<Arc<T>> {
        let inner = self.inner.lock();
        let idx = inner.records.partition_point(|r| r.id() < id);
        inner
            .records
            .get(idx)
            .filter(|r| r.id() == id)
            .cloned()
    }

    /// Highest id appended so far (0 when empty).
    pub fn last_id(&self) -> u64 {
        let inner = self.inner.lock();
        inner.records.last().map(|r| r.id()).unwrap_or(0)
    }

    /// Subscribe to every future append, in append order. The channel is
    /// unbounded: slow consumers queue, they do not stall the writer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Row {
        id: u64,
        stream: String,
        seq: u32,
        body: String,
        created_at: chrono::DateTime<Utc>,
    }

    impl Record for Row {
        fn id(&self) -> u64 {
            self.id
        }
        fn set_id(&mut self, id: u64) {
            self.id = id;
        }
        fn stream_key(&self) -> Option<&str> {
            Some(&self.stream)
        }
        fn seq(&self) -> u32 {
            self.seq
        }
        fn set_seq(&mut self, seq: u32) {
            self.seq = seq;
        }
    }

    fn row(stream: &str, body: &str) -> Row {
        Row {
            id: 0,
            stream: stream.into(),
            seq: 0,
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    fn open_log(dir: &tempfile::TempDir) -> JsonlLog<Row> {
        JsonlLog::open(dir.path().join("rows.jsonl")).unwrap()
    }

    #[test]
    fn append_assigns_monotonic_ids_and_dense_seqs() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        let a = log.append(vec![row("s1", "a")]).unwrap();
        let b = log.append(vec![row("s2", "b"), row("s1", "c")]).unwrap();

        assert_eq!(a[0].id, 1);
        assert_eq!(b[0].id, 2);
        assert_eq!(b[1].id, 3);
        assert_eq!(a[0].seq, 1);
        assert_eq!(b[0].seq, 1); // first of s2
        assert_eq!(b[1].seq, 2); // second of s1
    }

    #[test]
    fn read_all_from_id_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        log.append(vec![row("s", "a"), row("s", "b"), row("s", "c")])
            .unwrap();

        let tail = log.read_all(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].id, 2);

        assert!(log.read_all(3).is_empty());
        assert_eq!(log.read_all(0).len(), 3);
    }

    #[test]
    fn read_stream_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        log.append(vec![row("a", "1"), row("b", "2"), row("a", "3")])
            .unwrap();

        let a = log.read_stream("a", 1);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].seq, 1);
        assert_eq!(a[1].seq, 2);

        let from2 = log.read_stream("a", 2);
        assert_eq!(from2.len(), 1);
        assert_eq!(from2[0].body, "3");
    }

    #[test]
    fn read_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        log.append(vec![row("s", "a"), row("s", "b")]).unwrap();

        assert_eq!(log.read_by_id(2).unwrap().body, "b");
        assert!(log.read_by_id(99).is_none());
    }

    #[test]
    fn reload_restores_counters() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(&dir);
            log.append(vec![row("s", "a"), row("s", "b")]).unwrap();
        }
        let log = open_log(&dir);
        assert_eq!(log.last_id(), 2);

        let c = log.append(vec![row("s", "c")]).unwrap();
        assert_eq!(c[0].id, 3);
        assert_eq!(c[0].seq, 3);
    }

    #[test]
    fn corrupted_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        {
            let log: JsonlLog<Row> = JsonlLog::open(&path).unwrap();
            log.append(vec![row("s", "a")]).unwrap();
        }
        // Corrupt the file with a garbage line, then a valid one.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "{{not json").unwrap();
        }
        let log: JsonlLog<Row> = JsonlLog::open(&path).unwrap();
        assert_eq!(log.read_all(0).len(), 1);
        // The log still accepts appends after a partial load.
        log.append(vec![row("s", "b")]).unwrap();
        assert_eq!(log.read_all(0).len(), 2);
    }

    #[test]
    fn failed_write_rolls_back_counters() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        log.append(vec![row("s", "a")]).unwrap();

        // Remove the directory out from under the log so the append fails.
        std::fs::remove_dir_all(dir.path()).unwrap();
        assert!(log.append(vec![row("s", "b")]).is_err());

        // Counters rolled back: a later successful append continues the
        // sequence without gaps.
        std::fs::create_dir_all(dir.path()).unwrap();
        let c = log.append(vec![row("s", "c")]).unwrap();
        assert_eq!(c[0].id, 2);
        assert_eq!(c[0].seq, 2);
        assert_eq!(log.read_all(0).len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        let mut rx = log.subscribe();
        log.append(vec![row("s", "a"), row("s", "b")]).unwrap();
        log.append(vec![row("s", "c")]).unwrap();

        assert_eq!(rx.recv().await.unwrap().body, "a");
        assert_eq!(rx.recv().await.unwrap().body, "b");
        assert_eq!(rx.recv().await.unwrap().body, "c");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);

        let rx = log.subscribe();
        drop(rx);
        log.append(vec![row("s", "a")]).unwrap();
        assert!(log.subscribers.lock().is_empty());
    }

    #[test]
    fn empty_append_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir);
        assert!(log.append(Vec::new()).unwrap().is_empty());
        assert_eq!(log.last_id(), 0);
    }
}
