//! In-process backends.
//!
//! Every operation takes one mutex for its whole read-modify-write, which is
//! what makes the lease primitives atomic here. Used by tests, by the
//! sequential runner, and for embedding the engine without a database.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{CURSOR_BATCH_SIZE, Destination, DestinationRead, RecordCursor, Source};
use crate::error::{Error, Result};
use crate::event::ChunkEvent;
use crate::lease::{LeaseStats, LeaseStore};
use crate::model::*;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// A sorted in-memory collection of documents.
pub struct MemorySource {
    /// Sorted by key, keyless records first.
    records: Vec<SourceRecord>,
}

impl MemorySource {
    /// Build from documents, partitioning on `key_field`.
    ///
    /// Documents without the field (or with `null`) are kept with no key.
    pub fn from_documents(
        key_field: &str,
        documents: impl IntoIterator<Item = Value>,
    ) -> Result<Self> {
        let mut records = Vec::new();
        for document in documents {
            let key = match document.get(key_field) {
                Some(v) => Key::from_json(v)?,
                None => None,
            };
            records.push(SourceRecord { key, document });
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Self { records })
    }

    /// Keep only documents matching `predicate`.
    pub fn filtered(mut self, predicate: impl Fn(&Value) -> bool) -> Self {
        self.records.retain(|r| predicate(&r.document));
        self
    }

    fn in_range<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = &'a SourceRecord> {
        self.records
            .iter()
            .filter(move |r| r.key.as_ref().is_some_and(|k| range.contains(k)))
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn count(&self) -> Result<u64> {
        Ok(self.records.len() as u64)
    }

    async fn keys_after(&self, after: Option<&Key>, limit: usize) -> Result<Vec<Option<Key>>> {
        let keys = self
            .records
            .iter()
            .filter(|r| match after {
                Some(after) => r.key.as_ref().is_some_and(|k| k > after),
                None => true,
            })
            .take(limit)
            .map(|r| r.key.clone())
            .collect();
        Ok(keys)
    }

    async fn count_range(&self, range: &KeyRange) -> Result<u64> {
        Ok(self.in_range(range).count() as u64)
    }

    async fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        order: SortOrder,
    ) -> Result<Box<dyn RecordCursor>> {
        let mut records: Vec<SourceRecord> = match range {
            Some(range) => self.in_range(range).cloned().collect(),
            None => self.records.clone(),
        };
        if order == SortOrder::Descending {
            records.reverse();
        }
        Ok(Box::new(MemoryCursor {
            records: records.into_iter(),
        }))
    }
}

struct MemoryCursor {
    records: std::vec::IntoIter<SourceRecord>,
}

#[async_trait]
impl RecordCursor for MemoryCursor {
    async fn next_batch(&mut self) -> Result<Vec<SourceRecord>> {
        Ok(self.records.by_ref().take(CURSOR_BATCH_SIZE).collect())
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DestinationState {
    keyed: BTreeMap<Key, Map<String, Value>>,
    inserted: Vec<Map<String, Value>>,
}

/// An in-memory keyed store with optional write fault injection.
#[derive(Default)]
pub struct MemoryDestination {
    state: Mutex<DestinationState>,
    failing_writes: AtomicUsize,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch submissions fail without applying anything.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Every stored record as a document; keyed records carry `_id`.
    pub fn documents(&self) -> Vec<Value> {
        let state = lock(&self.state);
        let keyed = state.keyed.iter().map(|(id, fields)| {
            let mut doc = fields.clone();
            doc.insert(ID_FIELD.to_string(), id.to_json());
            Value::Object(doc)
        });
        let inserted = state.inserted.iter().cloned().map(Value::Object);
        keyed.chain(inserted).collect()
    }

    pub fn keyed_len(&self) -> usize {
        lock(&self.state).keyed.len()
    }

    pub fn inserted_len(&self) -> usize {
        lock(&self.state).inserted.len()
    }
}

#[async_trait]
impl DestinationRead for MemoryDestination {
    async fn count(&self) -> Result<u64> {
        let state = lock(&self.state);
        Ok((state.keyed.len() + state.inserted.len()) as u64)
    }

    async fn get(&self, id: &Key) -> Result<Option<Value>> {
        Ok(lock(&self.state)
            .keyed
            .get(id)
            .map(|fields| Value::Object(fields.clone())))
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn write_batch(&self, records: &[OutputRecord]) -> Result<()> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::Store("injected write failure".to_string()));
        }

        let mut state = lock(&self.state);
        for record in records {
            match record.id {
                Some(ref id) => {
                    let existing = state.keyed.entry(id.clone()).or_default();
                    for (field, value) in &record.fields {
                        existing.insert(field.clone(), value.clone());
                    }
                }
                None => state.inserted.push(record.fields.clone()),
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.keyed.clear();
        state.inserted.clear();
        Ok(())
    }

    fn as_read(&self) -> &dyn DestinationRead {
        self
    }
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LeaseState {
    chunks: BTreeMap<Key, Chunk>,
    events: Vec<ChunkEvent>,
}

/// Lease records for one job, held in process memory.
#[derive(Default)]
pub struct MemoryLeaseStore {
    state: Mutex<LeaseState>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a chunk back to `open`, as a reclaim would. Test hook for
    /// simulating a lease lost mid-chunk.
    #[cfg(test)]
    pub(crate) fn force_reopen(&self, start: &Key) {
        if let Some(chunk) = lock(&self.state).chunks.get_mut(start) {
            chunk.state = ChunkState::Open;
            chunk.owner = None;
        }
    }
}

fn transition(chunk: &mut Chunk, to: ChunkState) -> Result<()> {
    if !chunk.state.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            from: chunk.state,
            to,
        });
    }
    chunk.state = to;
    Ok(())
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn reset(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.chunks.clear();
        state.events.clear();
        Ok(())
    }

    async fn insert(&self, chunk: &Chunk) -> Result<()> {
        let mut state = lock(&self.state);
        if state.chunks.contains_key(&chunk.start) {
            return Err(Error::Store(format!(
                "duplicate chunk start {}",
                chunk.start
            )));
        }
        state.chunks.insert(chunk.start.clone(), chunk.clone());
        Ok(())
    }

    async fn claim_open(&self, owner: &WorkerId, now: DateTime<Utc>) -> Result<Option<Chunk>> {
        let mut state = lock(&self.state);
        let Some(chunk) = state
            .chunks
            .values_mut()
            .find(|c| c.state == ChunkState::Open)
        else {
            return Ok(None);
        };
        transition(chunk, ChunkState::Working)?;
        chunk.owner = Some(owner.clone());
        chunk.claimed_at = Some(now);
        Ok(Some(chunk.clone()))
    }

    async fn get(&self, start: &Key) -> Result<Option<Chunk>> {
        Ok(lock(&self.state).chunks.get(start).cloned())
    }

    async fn complete(
        &self,
        start: &Key,
        good: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ChunkState>> {
        let mut state = lock(&self.state);
        let chunk = state
            .chunks
            .get_mut(start)
            .ok_or_else(|| Error::NotFound(start.to_string()))?;
        if chunk.state.is_terminal() {
            return Ok(None);
        }
        let from = chunk.state;
        transition(chunk, ChunkState::Done)?;
        chunk.good = good;
        chunk.owner = None;
        chunk.finished_at = Some(now);
        Ok(Some(from))
    }

    async fn reopen_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Chunk>> {
        let mut state = lock(&self.state);
        let mut reopened = Vec::new();
        for chunk in state.chunks.values_mut() {
            let expired = chunk.state == ChunkState::Working
                && chunk.claimed_at.is_some_and(|t| t < cutoff);
            if expired {
                reopened.push(chunk.clone());
                transition(chunk, ChunkState::Open)?;
                chunk.owner = None;
            }
        }
        Ok(reopened)
    }

    async fn count_not_done(&self) -> Result<u64> {
        Ok(lock(&self.state)
            .chunks
            .values()
            .filter(|c| c.state != ChunkState::Done)
            .count() as u64)
    }

    async fn list(&self, state_filter: Option<ChunkState>) -> Result<Vec<Chunk>> {
        Ok(lock(&self.state)
            .chunks
            .values()
            .filter(|c| state_filter.is_none_or(|s| c.state == s))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<LeaseStats> {
        let state = lock(&self.state);
        let mut stats = LeaseStats::default();
        for chunk in state.chunks.values() {
            stats.chunks += 1;
            stats.records += chunk.total;
            match chunk.state {
                ChunkState::Open => stats.open += 1,
                ChunkState::Working => stats.working += 1,
                ChunkState::Done => {
                    stats.done += 1;
                    stats.good += chunk.good;
                }
            }
            if let Some(t) = chunk.finished_at.filter(|_| chunk.state == ChunkState::Done) {
                stats.first_finished = Some(stats.first_finished.map_or(t, |f| f.min(t)));
                stats.last_finished = Some(stats.last_finished.map_or(t, |l| l.max(t)));
            }
        }
        Ok(stats)
    }

    async fn append_event(&self, event: &ChunkEvent) -> Result<()> {
        lock(&self.state).events.push(event.clone());
        Ok(())
    }

    async fn events(&self, start: &Key) -> Result<Vec<ChunkEvent>> {
        Ok(lock(&self.state)
            .events
            .iter()
            .filter(|e| &e.chunk == start)
            .cloned()
            .collect())
    }
}
