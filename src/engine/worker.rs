//! Claim loop: take open chunks until none are left.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::processor::{ChunkOutcome, ChunkProcessor};
use crate::error::Result;
use crate::lease::LeaseTable;
use crate::model::{Chunk, WorkerId};
use crate::transform::Transform;

/// What one worker got through before exiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker: WorkerId,
    /// Chunks this worker retired as done.
    pub chunks_done: usize,
    /// Chunks left for the supervisor to reopen.
    pub chunks_abandoned: usize,
    pub records_good: u64,
}

impl WorkerSummary {
    fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            chunks_done: 0,
            chunks_abandoned: 0,
            records_good: 0,
        }
    }
}

pub struct Worker<T: Transform> {
    id: WorkerId,
    leases: LeaseTable,
    processor: Arc<ChunkProcessor<T>>,
    standby: Option<Duration>,
}

impl<T: Transform> Worker<T> {
    pub fn new(leases: LeaseTable, processor: Arc<ChunkProcessor<T>>) -> Self {
        Self {
            id: WorkerId::generate(),
            leases,
            processor,
            standby: None,
        }
    }

    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    /// Instead of exiting when nothing is open, poll every `interval` while
    /// unfinished chunks remain, to pick up reclaimed work.
    pub fn with_standby(mut self, interval: Duration) -> Self {
        self.standby = Some(interval);
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Claim and process chunks until the queue has nothing open.
    ///
    /// # Errors
    ///
    /// Only lease-table failures end the loop early. Everything that goes
    /// wrong inside a chunk is reflected in the summary instead.
    pub async fn run(self) -> Result<WorkerSummary> {
        info!(worker = %self.id, "worker started");
        let mut summary = WorkerSummary::new(self.id.clone());

        loop {
            let Some(chunk) = self.leases.claim_next(&self.id).await? else {
                match self.standby {
                    Some(interval) if self.leases.remaining_count().await? > 0 => {
                        debug!(worker = %self.id, "nothing open; standing by for reclaimed chunks");
                        tokio::time::sleep(interval).await;
                        continue;
                    }
                    _ => break,
                }
            };
            let outcome = self.processor.process(&chunk, &self.id).await?;
            self.retire(&chunk, &outcome, &mut summary).await?;
        }

        info!(
            worker = %self.id,
            chunks_done = summary.chunks_done,
            chunks_abandoned = summary.chunks_abandoned,
            records_good = summary.records_good,
            "worker finished: nothing left to claim"
        );
        Ok(summary)
    }

    /// Claim and process at most one chunk.
    pub async fn run_once(&self) -> Result<Option<ChunkOutcome>> {
        let Some(chunk) = self.leases.claim_next(&self.id).await? else {
            return Ok(None);
        };
        let outcome = self.processor.process(&chunk, &self.id).await?;
        let mut summary = WorkerSummary::new(self.id.clone());
        self.retire(&chunk, &outcome, &mut summary).await?;
        Ok(Some(outcome))
    }

    async fn retire(
        &self,
        chunk: &Chunk,
        outcome: &ChunkOutcome,
        summary: &mut WorkerSummary,
    ) -> Result<()> {
        let Some(good) = outcome.retire_with() else {
            info!(
                start = %chunk.start,
                outcome = outcome.name(),
                "chunk abandoned; left for reclaim"
            );
            summary.chunks_abandoned += 1;
            return Ok(());
        };

        if self.leases.mark_done(&chunk.start, good).await? {
            info!(start = %chunk.start, good, total = chunk.total, "chunk done");
        } else {
            info!(start = %chunk.start, "chunk already finished elsewhere; not updating");
        }
        summary.chunks_done += 1;
        summary.records_good += good;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::processor::ProcessorOptions;
    use crate::model::{ChunkState, Key, KeyRange, OutputRecord};
    use crate::store::{MemoryDestination, MemoryLeaseStore, MemorySource};
    use crate::transform::{TransformError, transform_fn};
    use serde_json::json;

    async fn queue(chunks: &[(i64, i64)]) -> LeaseTable {
        let leases = LeaseTable::new(Arc::new(MemoryLeaseStore::new()));
        for &(start, end) in chunks {
            leases
                .insert(&Chunk::open(KeyRange::new(start, end), (end - start + 1) as u64))
                .await
                .unwrap();
        }
        leases
    }

    #[tokio::test]
    async fn drains_the_queue_and_exits() {
        let leases = queue(&[(1, 3), (4, 6)]).await;
        let docs = (1..=6).map(|k| json!({"k": k}));
        let source = Arc::new(MemorySource::from_documents("k", docs).unwrap());
        let dest = Arc::new(MemoryDestination::new());
        let processor = Arc::new(ChunkProcessor::new(
            source,
            dest.clone(),
            leases.clone(),
            Arc::new(transform_fn(|r| {
                if r.key == Some(Key::Int(5)) {
                    return Err(TransformError::new("five"));
                }
                Ok(Some(OutputRecord::keyed(
                    r.key.clone().unwrap_or(Key::Int(0)),
                    r.document.clone(),
                )))
            })),
            ProcessorOptions::default(),
        ));

        let summary = Worker::new(leases.clone(), processor)
            .with_id(WorkerId::from("w"))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.chunks_done, 2);
        assert_eq!(summary.records_good, 5);
        assert_eq!(leases.remaining_count().await.unwrap(), 0);
        assert_eq!(dest.keyed_len(), 5);
        assert_eq!(leases.get(&Key::Int(4)).await.unwrap().unwrap().good, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn standby_worker_picks_up_a_reclaimed_chunk() {
        let clock = Arc::new(ManualClock::default());
        let leases = LeaseTable::new(Arc::new(MemoryLeaseStore::new())).with_clock(clock.clone());
        for (start, end) in [(1, 3), (4, 6)] {
            leases
                .insert(&Chunk::open(KeyRange::new(start, end), 3))
                .await
                .unwrap();
        }
        let stranded = leases
            .claim_next(&WorkerId::from("gone"))
            .await
            .unwrap()
            .unwrap();

        let docs = (1..=6).map(|k| json!({"k": k}));
        let source = Arc::new(MemorySource::from_documents("k", docs).unwrap());
        let dest = Arc::new(MemoryDestination::new());
        let processor = Arc::new(ChunkProcessor::new(
            source,
            dest.clone(),
            leases.clone(),
            Arc::new(transform_fn(|r| {
                Ok(Some(OutputRecord::keyed(
                    r.key.clone().unwrap_or(Key::Int(0)),
                    r.document.clone(),
                )))
            })),
            ProcessorOptions::default(),
        ));

        let worker = Worker::new(leases.clone(), processor)
            .with_id(WorkerId::from("w"))
            .with_standby(Duration::from_secs(1));
        let handle = tokio::spawn(worker.run());

        // Wait until the worker has run out of open chunks.
        while leases.remaining_count().await.unwrap() > 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!handle.is_finished());

        clock.advance(Duration::from_secs(121));
        let reclaimed = leases.reclaim_stale(Duration::from_secs(120)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.chunks_done, 2);
        assert_eq!(summary.records_good, 6);
        assert_eq!(leases.remaining_count().await.unwrap(), 0);
        assert_eq!(
            leases.get(&stranded.start).await.unwrap().unwrap().state,
            ChunkState::Done
        );
        assert_eq!(dest.keyed_len(), 6);
    }

    #[tokio::test]
    async fn run_once_on_empty_queue_is_none() {
        let leases = queue(&[]).await;
        let source = Arc::new(MemorySource::from_documents("k", Vec::new()).unwrap());
        let processor = Arc::new(ChunkProcessor::new(
            source,
            Arc::new(MemoryDestination::new()),
            leases.clone(),
            Arc::new(transform_fn(|_| Ok(None))),
            ProcessorOptions::default(),
        ));
        let worker = Worker::new(leases, processor);
        assert!(worker.run_once().await.unwrap().is_none());
    }
}
