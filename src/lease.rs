//! The lease table: durable per-chunk coordination state.
//!
//! This is the only thing workers share. Claim, completion and reclaim are
//! each one atomic read-modify-write against the backing [`LeaseStore`];
//! nothing else provides mutual exclusion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock, to_delta};
use crate::error::Result;
use crate::event::{ChunkEvent, ChunkEventKind};
use crate::model::*;
use crate::telemetry::metrics;

/// Backend primitives for one job's lease records.
///
/// Implementations must make `claim_open`, `complete` and
/// `reopen_claimed_before` atomic with respect to each other and to
/// concurrent callers in other processes.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Drop every chunk and event of the job.
    async fn reset(&self) -> Result<()>;

    async fn insert(&self, chunk: &Chunk) -> Result<()>;

    /// Atomically move one open chunk to working under `owner`.
    async fn claim_open(&self, owner: &WorkerId, now: DateTime<Utc>) -> Result<Option<Chunk>>;

    async fn get(&self, start: &Key) -> Result<Option<Chunk>>;

    /// Mark done unless already done. Returns the state the chunk left, or
    /// `None` when it was already done.
    async fn complete(
        &self,
        start: &Key,
        good: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ChunkState>>;

    /// Reopen every working chunk claimed strictly before `cutoff`.
    /// Returns the chunks as they were before reopening.
    async fn reopen_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Chunk>>;

    async fn count_not_done(&self) -> Result<u64>;

    async fn list(&self, state: Option<ChunkState>) -> Result<Vec<Chunk>>;

    async fn stats(&self) -> Result<LeaseStats>;

    async fn append_event(&self, event: &ChunkEvent) -> Result<()>;

    async fn events(&self, start: &Key) -> Result<Vec<ChunkEvent>>;
}

/// Aggregate view of a work queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseStats {
    pub chunks: u64,
    pub open: u64,
    pub working: u64,
    pub done: u64,
    /// Σ total over all chunks.
    pub records: u64,
    /// Σ good over done chunks.
    pub good: u64,
    pub first_finished: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
}

/// Handle to a job's lease table. Cheap to clone.
#[derive(Clone)]
pub struct LeaseTable {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseTable {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Drop the whole queue, ready for a fresh plan.
    pub async fn reset(&self) -> Result<()> {
        self.store.reset().await
    }

    pub async fn insert(&self, chunk: &Chunk) -> Result<()> {
        self.store.insert(chunk).await
    }

    /// Claim some open chunk for `owner`. `None` means nothing is open.
    pub async fn claim_next(&self, owner: &WorkerId) -> Result<Option<Chunk>> {
        let claimed = self.store.claim_open(owner, self.clock.now()).await?;
        if let Some(ref chunk) = claimed {
            debug!(start = %chunk.start, end = %chunk.end, %owner, "chunk claimed");
            metrics::chunks_claimed().add(1, &[]);
            record_transition(ChunkState::Open, ChunkState::Working);
        }
        Ok(claimed)
    }

    /// True iff the chunk is still working under `owner`.
    pub async fn is_still_owner(&self, start: &Key, owner: &WorkerId) -> Result<bool> {
        Ok(self
            .store
            .get(start)
            .await?
            .is_some_and(|c| c.is_owned_by(owner)))
    }

    /// Retire a chunk with its good count. A chunk someone else already
    /// finished is left untouched and `false` is returned.
    pub async fn mark_done(&self, start: &Key, good: u64) -> Result<bool> {
        let Some(from) = self.store.complete(start, good, self.clock.now()).await? else {
            return Ok(false);
        };
        record_transition(from, ChunkState::Done);
        Ok(true)
    }

    /// Reopen every working chunk held longer than `timeout`.
    pub async fn reclaim_stale(&self, timeout: Duration) -> Result<Vec<Chunk>> {
        let now = self.clock.now();
        let cutoff = now
            .checked_sub_signed(to_delta(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reclaimed = self.store.reopen_claimed_before(cutoff).await?;
        for chunk in &reclaimed {
            let held_secs = chunk
                .claimed_at
                .map(|t| (now - t).num_seconds())
                .unwrap_or_default();
            info!(
                start = %chunk.start,
                owner = chunk.owner.as_ref().map(|o| o.0.as_str()).unwrap_or("none"),
                held_secs,
                timeout_secs = timeout.as_secs(),
                "lease expired; chunk reopened"
            );
            record_transition(ChunkState::Working, ChunkState::Open);
            self.store
                .append_event(&ChunkEvent {
                    chunk: chunk.start.clone(),
                    timestamp: now,
                    worker: None,
                    kind: ChunkEventKind::Reclaimed {
                        owner: chunk.owner.clone(),
                        held_secs,
                    },
                })
                .await?;
        }
        Ok(reclaimed)
    }

    /// Chunks not yet done. Zero means the job is complete.
    pub async fn remaining_count(&self) -> Result<u64> {
        self.store.count_not_done().await
    }

    pub async fn get(&self, start: &Key) -> Result<Option<Chunk>> {
        self.store.get(start).await
    }

    pub async fn chunks(&self, state: Option<ChunkState>) -> Result<Vec<Chunk>> {
        self.store.list(state).await
    }

    pub async fn stats(&self) -> Result<LeaseStats> {
        self.store.stats().await
    }

    pub async fn progress(&self) -> Result<Progress> {
        Ok(Progress::from_stats(&self.stats().await?))
    }

    /// Append to the chunk's event log, stamped with the table's clock.
    pub async fn record_event(
        &self,
        chunk: &Key,
        worker: Option<&WorkerId>,
        kind: ChunkEventKind,
    ) -> Result<()> {
        self.store
            .append_event(&ChunkEvent {
                chunk: chunk.clone(),
                timestamp: self.clock.now(),
                worker: worker.cloned(),
                kind,
            })
            .await
    }

    pub async fn events(&self, chunk: &Key) -> Result<Vec<ChunkEvent>> {
        self.store.events(chunk).await
    }
}

fn record_transition(from: ChunkState, to: ChunkState) {
    metrics::chunk_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Completion estimate extrapolated from finished chunks.
#[derive(Debug, Clone, PartialEq)]
pub enum Eta {
    /// Nothing finished yet, or finish times missing.
    NoData,
    Estimate {
        /// Seconds between the first and last chunk completion.
        elapsed_secs: f64,
        estimated_total_secs: f64,
        remaining_secs: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
    pub eta: Eta,
}

impl Progress {
    pub fn from_stats(stats: &LeaseStats) -> Self {
        let done_fraction = if stats.chunks == 0 {
            0.0
        } else {
            stats.done as f64 / stats.chunks as f64
        };

        let eta = match (stats.first_finished, stats.last_finished) {
            (Some(first), Some(last)) if done_fraction > 0.0 => {
                let elapsed = (last - first).num_milliseconds() as f64 / 1000.0;
                let estimated_total = elapsed / done_fraction;
                Eta::Estimate {
                    elapsed_secs: elapsed,
                    estimated_total_secs: estimated_total,
                    remaining_secs: estimated_total - elapsed,
                }
            }
            _ => Eta::NoData,
        };

        Self {
            done: stats.done,
            total: stats.chunks,
            eta,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.done as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.eta {
            Eta::NoData if self.done == 0 => write!(
                f,
                "0 of {} chunks complete; nothing done so far",
                self.total
            ),
            Eta::NoData => write!(
                f,
                "{} of {} chunks complete; no progress data yet",
                self.done, self.total
            ),
            Eta::Estimate {
                elapsed_secs,
                remaining_secs,
                ..
            } => write!(
                f,
                "{} of {} chunks complete ({:.3}%); {:.3}s elapsed, {:.3}s remaining ({:.5} hours)",
                self.done,
                self.total,
                self.percent(),
                elapsed_secs,
                remaining_secs,
                remaining_secs / 3600.0
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::KeyRange;
    use crate::store::MemoryLeaseStore;
    use chrono::TimeZone;

    #[tokio::test]
    async fn completion_reports_the_state_it_left() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryLeaseStore::new());
        let leases = LeaseTable::new(store.clone()).with_clock(clock.clone());
        for (start, end) in [(1, 5), (6, 10)] {
            leases
                .insert(&Chunk::open(KeyRange::new(start, end), 5))
                .await
                .unwrap();
        }
        let first = leases.claim_next(&WorkerId::from("w1")).await.unwrap().unwrap();
        let second = leases.claim_next(&WorkerId::from("w2")).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(121));
        assert_eq!(leases.reclaim_stale(Duration::from_secs(120)).await.unwrap().len(), 2);
        leases.claim_next(&WorkerId::from("w3")).await.unwrap().unwrap();

        let now = clock.now();
        assert_eq!(
            store.complete(&first.start, 5, now).await.unwrap(),
            Some(ChunkState::Working)
        );
        // Reclaimed and never claimed again: retired straight from open.
        assert_eq!(
            store.complete(&second.start, 4, now).await.unwrap(),
            Some(ChunkState::Open)
        );
        assert_eq!(store.complete(&second.start, 4, now).await.unwrap(), None);
        assert!(!leases.mark_done(&first.start, 5).await.unwrap());
    }

    #[test]
    fn progress_without_finished_chunks_has_no_eta() {
        let stats = LeaseStats {
            chunks: 4,
            open: 4,
            ..Default::default()
        };
        let progress = Progress::from_stats(&stats);
        assert_eq!(progress.eta, Eta::NoData);
        assert_eq!(progress.percent(), 0.0);
        assert!(progress.to_string().contains("nothing done so far"));
    }

    #[test]
    fn progress_on_empty_queue_does_not_divide_by_zero() {
        let progress = Progress::from_stats(&LeaseStats::default());
        assert_eq!(progress.eta, Eta::NoData);
        assert_eq!(progress.percent(), 0.0);
    }

    #[test]
    fn progress_extrapolates_from_finish_times() {
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let stats = LeaseStats {
            chunks: 4,
            done: 2,
            working: 2,
            first_finished: Some(first),
            last_finished: Some(first + chrono::TimeDelta::seconds(30)),
            ..Default::default()
        };
        match Progress::from_stats(&stats).eta {
            Eta::Estimate {
                elapsed_secs,
                estimated_total_secs,
                remaining_secs,
            } => {
                assert_eq!(elapsed_secs, 30.0);
                assert_eq!(estimated_total_secs, 60.0);
                assert_eq!(remaining_secs, 30.0);
            }
            Eta::NoData => panic!("expected an estimate"),
        }
    }
}
