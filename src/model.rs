//! Core data model.
//!
//! A chunk is a contiguous key range of the source dataset. It is leased to
//! at most one worker at a time and tracked through a small lifecycle
//! (open → working → done, with working → open on reclaim).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Document field carrying an output record's identity.
pub const ID_FIELD: &str = "_id";

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// A partition key value.
///
/// Keys are totally ordered. Integers sort before strings, so a mixed-type
/// key column still has a well-defined order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Read a key out of a JSON value.
    ///
    /// `null` means "no key" and yields `Ok(None)`. Anything that is neither
    /// an integer nor a string cannot be ordered as a key.
    pub fn from_json(value: &Value) -> Result<Option<Key>> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(Key::Text(s.clone()))),
            Value::Number(n) => n
                .as_i64()
                .map(|i| Some(Key::Int(i)))
                .ok_or_else(|| Error::InvalidKey(format!("non-integer number {n}"))),
            other => Err(Error::InvalidKey(format!("unsupported key value {other}"))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Text(s) => Value::from(s.clone()),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Inclusive key range `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        &self.start <= key && key <= &self.end
    }
}

/// Iteration order within a chunk, along the partition key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Lifecycle state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// Waiting for a worker.
    Open,
    /// Leased to exactly one worker.
    Working,
    /// Finished. Terminal.
    Done,
}

impl ChunkState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, to),
            (Open, Working)
                | (Working, Done)
                | (Working, Open) // lease expired, reclaimed
                | (Open, Done) // finished by a worker that was falsely dispossessed
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ChunkState::Done
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkState::Open => "open",
            ChunkState::Working => "working",
            ChunkState::Done => "done",
        }
    }
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(ChunkState::Open),
            "working" => Ok(ChunkState::Working),
            "done" => Ok(ChunkState::Done),
            _ => Err(Error::Other(format!("unknown chunk state: {s}"))),
        }
    }
}

/// One lease record: a key range plus its coordination state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Identity of the chunk. Unique within a job.
    pub start: Key,
    pub end: Key,

    /// Matching source records in `[start, end]`, counted at planning time.
    pub total: u64,

    /// Records whose transform succeeded. Set when the chunk is marked done.
    pub good: u64,

    pub state: ChunkState,

    /// Present iff `state == Working`.
    pub owner: Option<WorkerId>,

    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Chunk {
    /// A freshly planned chunk.
    pub fn open(range: KeyRange, total: u64) -> Self {
        Self {
            start: range.start,
            end: range.end,
            total,
            good: 0,
            state: ChunkState::Open,
            owner: None,
            claimed_at: None,
            finished_at: None,
        }
    }

    pub fn range(&self) -> KeyRange {
        KeyRange {
            start: self.start.clone(),
            end: self.end.clone(),
        }
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.state == ChunkState::Working && self.owner.as_ref() == Some(worker)
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// Globally unique identity of a worker: process id plus a random suffix,
/// so several workers in one process stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn generate() -> Self {
        Self(format!("{}:{}", std::process::id(), Uuid::new_v4().simple()))
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::generate()
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A source document, addressed by its partition key. Read-only to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub key: Option<Key>,
    pub document: Value,
}

impl SourceRecord {
    pub fn new(key: impl Into<Key>, document: Value) -> Self {
        Self {
            key: Some(key.into()),
            document,
        }
    }

    /// Field lookup on the underlying document.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.document.get(field)
    }
}

/// What a transform produces for one source record.
///
/// With an identity the record is upserted (idempotent); without one it is
/// inserted as a new destination record (not idempotent).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutputRecord {
    pub id: Option<Key>,
    pub fields: Map<String, Value>,
}

impl OutputRecord {
    /// An identity-bearing output. Non-object `fields` are stored under `value`.
    pub fn keyed(id: impl Into<Key>, fields: Value) -> Self {
        Self {
            id: Some(id.into()),
            fields: into_map(fields),
        }
    }

    /// A keyless output, written by plain insert.
    pub fn unkeyed(fields: Value) -> Self {
        Self {
            id: None,
            fields: into_map(fields),
        }
    }

    /// Split a document into identity (`_id`) and fields.
    pub fn from_document(document: Value) -> Result<Self> {
        let mut fields = into_map(document);
        let id = match fields.remove(ID_FIELD) {
            Some(v) => Key::from_json(&v)?,
            None => None,
        };
        Ok(Self { id, fields })
    }

    /// The record as a single document, identity under `_id`.
    pub fn to_document(&self) -> Value {
        let mut doc = self.fields.clone();
        if let Some(ref id) = self.id {
            doc.insert(ID_FIELD.to_string(), id.to_json());
        }
        Value::Object(doc)
    }

    pub fn is_keyed(&self) -> bool {
        self.id.is_some()
    }

    /// Serialized size in bytes; drives the bulk flush threshold.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.to_document())
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
