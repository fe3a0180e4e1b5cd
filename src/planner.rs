//! Partition planning: chunk sizing and boundary computation.
//!
//! Runs once per job. Walks the source's ascending key stream in windows of
//! `chunk_size` keys and seeds the lease table with one open chunk per window.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lease::LeaseTable;
use crate::model::{Chunk, Key, KeyRange};
use crate::store::Source;

/// Summary of a completed plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub chunk_size: usize,
    pub chunks: usize,
    /// Σ total over the planned chunks.
    pub records: u64,
}

/// Pick a chunk size for `count` records over `parallelism` workers.
///
/// Aims for about ten chunks per worker, never below ten records per chunk,
/// shrinking toward one record per chunk when the dataset is too small to
/// give every worker a chunk. An explicit size wins (floored at 1).
pub fn chunk_size(count: u64, parallelism: usize, explicit: Option<usize>) -> usize {
    if let Some(size) = explicit {
        return size.max(1);
    }
    let multi = parallelism.max(1) as f64;
    let count = count as f64;

    let mut cs = (count / (multi * 10.0)).max(10.0);
    let per_worker = count / (cs * multi);
    if per_worker < 1.0 {
        cs = (cs * per_worker).floor().max(1.0);
    }
    cs as usize
}

pub struct PartitionPlanner<'a> {
    source: &'a dyn Source,
    leases: &'a LeaseTable,
}

impl<'a> PartitionPlanner<'a> {
    pub fn new(source: &'a dyn Source, leases: &'a LeaseTable) -> Self {
        Self { source, leases }
    }

    /// Count the source, size chunks for `parallelism` and plan.
    pub async fn plan_for(&self, parallelism: usize, explicit: Option<usize>) -> Result<Plan> {
        if parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".to_string()));
        }
        let count = self.source.count().await?;
        let size = chunk_size(count, parallelism, explicit);
        info!(records = count, parallelism, chunk_size = size, "planning partitions");
        self.plan(size).await
    }

    /// Replace the job's work queue with chunks of `chunk_size` keys.
    ///
    /// # Errors
    ///
    /// [`Error::Initialization`] if a window boundary has no key. Planning
    /// stops there; chunks persisted so far are left for inspection.
    pub async fn plan(&self, chunk_size: usize) -> Result<Plan> {
        let chunk_size = chunk_size.max(1);
        self.leases.reset().await?;

        let mut after: Option<Key> = None;
        let mut chunks = 0usize;
        let mut records = 0u64;

        loop {
            let window = self.source.keys_after(after.as_ref(), chunk_size).await?;
            let (Some(first), Some(last)) = (window.first(), window.last()) else {
                break;
            };

            let (start, end) = match (first, last) {
                (Some(start), Some(end)) => (start.clone(), end.clone()),
                _ => {
                    return Err(Error::Initialization(format!(
                        "partition key missing at chunk boundary (start: {}, end: {})",
                        display_key(first),
                        display_key(last)
                    )));
                }
            };

            let range = KeyRange { start, end };
            let total = self.source.count_range(&range).await?;
            debug!(chunk = chunks, start = %range.start, end = %range.end, total, "chunk planned");

            self.leases.insert(&Chunk::open(range.clone(), total)).await?;
            chunks += 1;
            records += total;
            after = Some(range.end);
        }

        info!(chunks, records, chunk_size, "work queue initialized");
        Ok(Plan {
            chunk_size,
            chunks,
            records,
        })
    }
}

fn display_key(key: &Option<Key>) -> String {
    key.as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}
