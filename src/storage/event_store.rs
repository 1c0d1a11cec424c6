//! `EventStore` trait and implementations.
//!
//! The event store is the single source of truth. It supports appending at
//! the tail and reading the full ordered sequence; nothing else. Writing
//! requires `&mut` access to a store handle, and the file-backed handle can
//! only be acquired by one process at a time.

use crate::core::events::{Event, EventBody, EventId, REQUIRED_FIELDS};
use crate::storage::legacy::normalize_record;
use fs2::FileExt;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors that can occur in the event store.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid JSON at line {line}: {message}")]
    InvalidJson { line: usize, message: String },
    #[error("expected event_seq={expected}, got {found}")]
    SequenceViolation { expected: u64, found: u64 },
    #[error("duplicate event_id {0}")]
    DuplicateId(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("event store is locked by another writer ({})", .0.display())]
    WriterLocked(PathBuf),
}

impl EventStoreError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::InvalidJson { .. } => "jsonl_invalid",
            Self::SequenceViolation { .. } => "event_seq_non_monotonic",
            Self::DuplicateId(_) => "event_id_duplicate",
            Self::MalformedEvent(_) => "event_malformed",
            Self::WriterLocked(_) => "writer_locked",
        }
    }

    /// Whether this error means the stored history itself is unusable.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidJson { .. }
                | Self::SequenceViolation { .. }
                | Self::DuplicateId(_)
                | Self::MalformedEvent(_)
        )
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

/// Trait for event storage backends.
pub trait EventStore {
    /// Reads all events in `event_seq` order.
    fn read_all(&self) -> Result<Vec<Event>>;

    /// Sequence number of the last stored event, 0 when empty.
    fn last_seq(&self) -> u64;

    /// Appends events at the tail as one durable write.
    ///
    /// Every event is checked before anything is written; one bad event
    /// rejects the whole batch. Returns the new `last_seq`.
    fn append_batch(&mut self, events: &[Event]) -> Result<u64>;

    /// Appends a single event, returning its `event_seq`.
    fn append(&mut self, event: Event) -> Result<u64> {
        self.append_batch(std::slice::from_ref(&event))
    }

    /// Raw log content, used for forensic snapshots.
    fn raw_bytes(&self) -> Result<Vec<u8>>;
}

impl<T: EventStore + ?Sized> EventStore for Box<T> {
    fn read_all(&self) -> Result<Vec<Event>> {
        (**self).read_all()
    }

    fn last_seq(&self) -> u64 {
        (**self).last_seq()
    }

    fn append_batch(&mut self, events: &[Event]) -> Result<u64> {
        (**self).append_batch(events)
    }

    fn raw_bytes(&self) -> Result<Vec<u8>> {
        (**self).raw_bytes()
    }
}

/// Append-time bookkeeping shared by the store implementations.
#[derive(Debug, Default, Clone)]
struct Tail {
    last_seq: u64,
    ids: HashSet<String>,
}

impl Tail {
    fn from_events(events: &[Event]) -> Self {
        Self {
            last_seq: events.last().map_or(0, |e| e.event_seq),
            ids: events.iter().map(|e| e.event_id.to_string()).collect(),
        }
    }

    /// Checks a batch against the tail without mutating it.
    fn check(&self, events: &[Event]) -> Result<()> {
        let mut expected = self.last_seq + 1;
        let mut batch_ids = HashSet::new();
        for event in events {
            check_envelope(event)?;
            if event.event_seq != expected {
                return Err(EventStoreError::SequenceViolation {
                    expected,
                    found: event.event_seq,
                });
            }
            let id = event.event_id.as_str();
            if self.ids.contains(id) || !batch_ids.insert(id) {
                return Err(EventStoreError::DuplicateId(id.to_string()));
            }
            expected += 1;
        }
        Ok(())
    }

    fn commit(&mut self, events: &[Event]) {
        for event in events {
            self.last_seq = event.event_seq;
            self.ids.insert(event.event_id.to_string());
        }
    }
}

fn check_envelope(event: &Event) -> Result<()> {
    let missing = if event.schema_version.is_empty() {
        Some("schema_version")
    } else if event.event_id.as_str().is_empty() {
        Some("event_id")
    } else if event.actor.is_empty() {
        Some("actor")
    } else {
        None
    };
    if let Some(field) = missing {
        return Err(EventStoreError::MalformedEvent(format!(
            "missing field: {field}"
        )));
    }
    if let EventBody::Unrecognized { action, .. } = &event.body {
        return Err(EventStoreError::MalformedEvent(format!(
            "action outside the vocabulary: {action}"
        )));
    }
    Ok(())
}

/// Strictly parses a JSONL log.
///
/// Legacy records are normalized first. Sequence numbers must start at 1
/// and increase by exactly one; event ids must be unique.
pub fn parse_log(content: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let mut seen = HashSet::new();
    let mut last_seq = 0_u64;

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let raw: Value = serde_json::from_str(line).map_err(|e| EventStoreError::InvalidJson {
            line: line_no,
            message: e.to_string(),
        })?;
        let Value::Object(record) = raw else {
            return Err(EventStoreError::MalformedEvent(format!(
                "line {line_no}: record is not a JSON object"
            )));
        };
        let mut record = normalize_record(record);

        let Some(seq) = record.get("event_seq").and_then(Value::as_u64) else {
            return Err(EventStoreError::MalformedEvent(format!(
                "line {line_no}: event_seq missing or invalid"
            )));
        };
        if seq != last_seq + 1 {
            return Err(EventStoreError::SequenceViolation {
                expected: last_seq + 1,
                found: seq,
            });
        }
        last_seq = seq;

        let event_id = record
            .entry("event_id")
            .or_insert_with(|| Value::from(EventId::legacy(seq).to_string()))
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                EventStoreError::MalformedEvent(format!("line {line_no}: event_id is not a string"))
            })?;
        if !seen.insert(event_id.clone()) {
            return Err(EventStoreError::DuplicateId(event_id));
        }

        let missing: Vec<&str> = REQUIRED_FIELDS
            .into_iter()
            .filter(|field| !record.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(EventStoreError::MalformedEvent(format!(
                "line {line_no}: missing fields: {}",
                missing.join(", ")
            )));
        }

        let event: Event = serde_json::from_value(Value::Object(record))
            .map_err(|e| EventStoreError::MalformedEvent(format!("line {line_no}: {e}")))?;
        events.push(event);
    }

    Ok(events)
}

/// Reads a log file without taking the writer lock. A missing file is an
/// empty log.
pub fn read_log(path: &Path) -> Result<Vec<Event>> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_log(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Serializes events as JSONL, one compact record per line.
pub fn encode_lines(events: &[Event]) -> Result<String> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    Ok(out)
}

/// In-memory event store for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventStore {
    events: Vec<Event>,
    tail: Tail,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a store with an already-validated history.
    pub fn from_events(events: Vec<Event>) -> Result<Self> {
        let mut store = Self::new();
        store.append_batch(&events)?;
        Ok(store)
    }

    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }
}

impl EventStore for InMemoryEventStore {
    fn read_all(&self) -> Result<Vec<Event>> {
        Ok(self.events.clone())
    }

    fn last_seq(&self) -> u64 {
        self.tail.last_seq
    }

    fn append_batch(&mut self, events: &[Event]) -> Result<u64> {
        self.tail.check(events)?;
        self.tail.commit(events);
        self.events.extend_from_slice(events);
        Ok(self.tail.last_seq)
    }

    fn raw_bytes(&self) -> Result<Vec<u8>> {
        Ok(encode_lines(&self.events)?.into_bytes())
    }
}

/// File-based event store (append-only JSON lines).
///
/// Holding a `FileEventStore` is holding the writer role: `open` takes an
/// exclusive advisory lock that lives as long as the handle.
#[derive(Debug)]
pub struct FileEventStore {
    path: PathBuf,
    lock: File,
    tail: Tail,
}

impl FileEventStore {
    /// Acquires the writer lock and opens (or creates) the log.
    ///
    /// # Errors
    /// Returns `WriterLocked` if another handle holds the lock, or a parse
    /// error if the existing log is not a valid history.
    pub fn open(path: impl Into<PathBuf>, lock_path: &Path) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            return Err(EventStoreError::WriterLocked(lock_path.to_path_buf()));
        }

        if !path.exists() {
            File::create(&path)?;
        }
        let events = read_log(&path)?;
        debug!(path = %path.display(), events = events.len(), "opened event store");

        Ok(Self {
            tail: Tail::from_events(&events),
            path,
            lock,
        })
    }

    /// Returns the path to the event file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Empties the log. Only `init --force` uses this.
    pub fn truncate(&mut self) -> Result<()> {
        File::create(&self.path)?.sync_all()?;
        self.tail = Tail::default();
        Ok(())
    }
}

impl EventStore for FileEventStore {
    /// Re-reads the file so that external tampering is observed.
    fn read_all(&self) -> Result<Vec<Event>> {
        read_log(&self.path)
    }

    fn last_seq(&self) -> u64 {
        self.tail.last_seq
    }

    fn append_batch(&mut self, events: &[Event]) -> Result<u64> {
        if events.is_empty() {
            return Ok(self.tail.last_seq);
        }
        self.tail.check(events)?;

        let lines = encode_lines(events)?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(lines.as_bytes())?;
        file.sync_data()?;

        self.tail.commit(events);
        debug!(last_seq = self.tail.last_seq, count = events.len(), "appended events");
        Ok(self.tail.last_seq)
    }

    fn raw_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.path)?)
    }
}

impl Drop for FileEventStore {
    fn drop(&mut self) {
        // Closing the file releases the lock as well; unlock eagerly anyway.
        let _ = FileExt::unlock(&self.lock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{ClaimPayload, RunEndPayload};
    use crate::core::state::RunStatus;
    use chrono::Utc;

    fn claim(seq: u64) -> Event {
        Event::new(
            seq,
            "agent-a",
            Utc::now(),
            EventBody::Claim(ClaimPayload {
                task_id: "T-1".to_string(),
                notes: None,
            }),
        )
    }

    fn run_end(seq: u64) -> Event {
        Event::new(
            seq,
            "orchestrator",
            Utc::now(),
            EventBody::RunEnd(RunEndPayload {
                status: RunStatus::Success,
                reason: None,
            }),
        )
    }

    #[test]
    fn in_memory_store_append_and_read() {
        let mut store = InMemoryEventStore::new();
        assert_eq!(store.append(claim(1)).unwrap(), 1);
        assert_eq!(store.append(run_end(2)).unwrap(), 2);

        let events = store.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(store.last_seq(), 2);
    }

    #[test]
    fn append_rejects_gaps_and_replays() {
        let mut store = InMemoryEventStore::new();
        store.append(claim(1)).unwrap();

        let gap = store.append(claim(3)).unwrap_err();
        assert!(matches!(
            gap,
            EventStoreError::SequenceViolation {
                expected: 2,
                found: 3
            }
        ));

        let replay = store.append(claim(1)).unwrap_err();
        assert_eq!(replay.code(), "event_seq_non_monotonic");
        assert_eq!(store.last_seq(), 1);
    }

    #[test]
    fn append_rejects_duplicate_ids() {
        let mut store = InMemoryEventStore::new();
        store.append(claim(1)).unwrap();

        let mut dup = claim(2);
        dup.event_id = EventId::from_seq(1);
        let err = store.append(dup).unwrap_err();
        assert!(matches!(err, EventStoreError::DuplicateId(ref id) if id == "EV-00000001"));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let mut store = InMemoryEventStore::new();
        let err = store.append_batch(&[claim(1), claim(2), claim(4)]);
        assert!(err.is_err());
        assert_eq!(store.last_seq(), 0);
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn append_refuses_unknown_actions_and_blank_actor() {
        let mut store = InMemoryEventStore::new();
        let unknown = Event::new(
            1,
            "orchestrator",
            Utc::now(),
            EventBody::Unrecognized {
                action: "task.delete".to_string(),
                payload: Value::Null,
            },
        );
        assert_eq!(store.append(unknown).unwrap_err().code(), "event_malformed");

        let mut blank = claim(1);
        blank.actor = String::new();
        assert_eq!(store.append(blank).unwrap_err().code(), "event_malformed");
    }

    #[test]
    fn parse_log_detects_corruption() {
        let good = encode_lines(&[claim(1), run_end(2)]).unwrap();
        assert_eq!(parse_log(&good).unwrap().len(), 2);

        let not_json = format!("{good}{{oops\n");
        assert_eq!(parse_log(&not_json).unwrap_err().code(), "jsonl_invalid");

        let out_of_order = encode_lines(&[run_end(2)]).unwrap();
        assert_eq!(
            parse_log(&out_of_order).unwrap_err().code(),
            "event_seq_non_monotonic"
        );

        let missing = r#"{"event_seq":1,"event_id":"EV-00000001","action":"claim","payload":{"task_id":"T-1"}}"#;
        let err = parse_log(missing).unwrap_err();
        assert_eq!(err.code(), "event_malformed");
        assert!(err.to_string().contains("ts"));
    }

    #[test]
    fn parse_log_normalizes_legacy_records() {
        let legacy = concat!(
            r#"{"event_seq":1,"ts":"2026-01-01T00:00:00Z","actor":"orchestrator","action":"run.init","data":{"run_id":"RUN-1"}}"#,
            "\n"
        );
        let events = parse_log(legacy).unwrap();
        assert_eq!(events[0].event_id.as_str(), "LEGACY-EV-00000001");
        assert_eq!(events[0].schema_version, "0.3.0");
        assert_eq!(events[0].action_name(), "run.start");
    }

    #[test]
    fn file_store_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".roadmap/activity.jsonl");
        let lock = dir.path().join(".roadmap/activity.lock");

        {
            let mut store = FileEventStore::open(&path, &lock).unwrap();
            store.append_batch(&[claim(1), run_end(2)]).unwrap();
        }

        let store = FileEventStore::open(&path, &lock).unwrap();
        assert_eq!(store.last_seq(), 2);
        assert_eq!(store.read_all().unwrap()[1].action_name(), "run.end");
    }

    #[test]
    fn second_writer_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let lock = dir.path().join("activity.lock");

        let _writer = FileEventStore::open(&path, &lock).unwrap();
        let err = FileEventStore::open(&path, &lock).unwrap_err();
        assert!(matches!(err, EventStoreError::WriterLocked(_)));

        // Readers never need the lock.
        assert!(read_log(&path).unwrap().is_empty());
    }
}
