//! Storage seams: where records come from and where outputs go.
//!
//! The engine only speaks to these traits. `memory` backs them with
//! in-process structures; `crate::db` backs them with Postgres.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::{Key, KeyRange, OutputRecord, SortOrder, SourceRecord};

pub use memory::{MemoryDestination, MemoryLeaseStore, MemorySource};

/// Records fetched per cursor round trip.
pub const CURSOR_BATCH_SIZE: usize = 600;

/// Ordered, range-queryable source of records.
///
/// Any filter the job applies is a property of the source: every method
/// sees only matching records.
#[async_trait]
pub trait Source: Send + Sync {
    /// Number of matching records.
    async fn count(&self) -> Result<u64>;

    /// Up to `limit` partition keys in ascending order, strictly after
    /// `after` when given. Records without a key sort first and come back
    /// as `None`.
    async fn keys_after(&self, after: Option<&Key>, limit: usize) -> Result<Vec<Option<Key>>>;

    /// Exact number of matching records with key in `range`.
    async fn count_range(&self, range: &KeyRange) -> Result<u64>;

    /// Sorted iteration over `range`, or over every matching record when
    /// `range` is `None`. The cursor must survive arbitrarily slow consumers.
    async fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        order: SortOrder,
    ) -> Result<Box<dyn RecordCursor>>;
}

/// A long-lived read cursor.
#[async_trait]
pub trait RecordCursor: Send {
    /// Next batch in cursor order. An empty batch means exhausted.
    async fn next_batch(&mut self) -> Result<Vec<SourceRecord>>;
}

/// The read-only half of a destination, handed to transform init hooks.
#[async_trait]
pub trait DestinationRead: Send + Sync {
    async fn count(&self) -> Result<u64>;

    /// Fields of the record stored under `id`, if any.
    async fn get(&self, id: &Key) -> Result<Option<Value>>;
}

/// Keyed destination store.
#[async_trait]
pub trait Destination: DestinationRead {
    /// Submit a batch mixing upserts (keyed records: insert if absent,
    /// otherwise replace only the carried fields) and plain inserts
    /// (keyless records).
    async fn write_batch(&self, records: &[OutputRecord]) -> Result<()>;

    /// Remove every record.
    async fn clear(&self) -> Result<()>;

    fn as_read(&self) -> &dyn DestinationRead;
}
