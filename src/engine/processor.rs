//! Per-chunk execution.
//!
//! Streams one claimed chunk's records through the transform and into a
//! [`BulkWriter`]. Ownership is re-validated before any write leaves the
//! process: at the start, before every flush, at the end, and optionally on
//! a timer. A chunk whose lease was lost discards its pending output and
//! returns without touching the lease table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, info, warn};

use super::writer::{BulkWriter, DEFAULT_FLUSH_THRESHOLD, FlushOutcome};
use crate::clock::to_delta;
use crate::error::Result;
use crate::event::ChunkEventKind;
use crate::lease::LeaseTable;
use crate::model::{Chunk, SortOrder, WorkerId};
use crate::store::{Destination, Source};
use crate::telemetry::chunk::{record_outcome, start_chunk_span};
use crate::telemetry::metrics;
use crate::transform::Transform;

/// What to do when a bulk submission fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailurePolicy {
    /// Log, drop the batch, keep going.
    #[default]
    BestEffort,
    /// Abort the chunk and leave its lease to expire.
    FailChunk,
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub sort: SortOrder,
    /// Serialized bytes of pending output that trigger a flush.
    pub flush_threshold: usize,
    /// Re-validate ownership at the next record once this much time has
    /// passed since the last check, flush or not.
    pub recheck_interval: Option<Duration>,
    pub write_failure: WriteFailurePolicy,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            sort: SortOrder::Ascending,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            recheck_interval: None,
            write_failure: WriteFailurePolicy::BestEffort,
        }
    }
}

/// How a chunk run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Range exhausted with ownership intact.
    Completed {
        good: u64,
        failed: u64,
        written: usize,
        /// Outputs lost to failed bulk submissions.
        dropped: usize,
    },
    /// The init hook failed; no record was read.
    InitFailed { error: String },
    /// The lease moved elsewhere; pending output was discarded.
    LostOwnership { good: u64, discarded: usize },
    /// A bulk submission failed under [`WriteFailurePolicy::FailChunk`].
    WriteFailed { good: u64, error: String },
    /// Reading the source failed mid-chunk.
    SourceFailed { good: u64, error: String },
}

impl ChunkOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkOutcome::Completed { .. } => "completed",
            ChunkOutcome::InitFailed { .. } => "init_failed",
            ChunkOutcome::LostOwnership { .. } => "lost_ownership",
            ChunkOutcome::WriteFailed { .. } => "write_failed",
            ChunkOutcome::SourceFailed { .. } => "source_failed",
        }
    }

    /// Good count to retire the chunk with, or `None` if the chunk must be
    /// abandoned to the supervisor.
    pub fn retire_with(&self) -> Option<u64> {
        match self {
            ChunkOutcome::Completed { good, .. } => Some(*good),
            ChunkOutcome::InitFailed { .. } => Some(0),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    good: u64,
    failed: u64,
    written: usize,
    dropped: usize,
}

pub struct ChunkProcessor<T: Transform> {
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    leases: LeaseTable,
    transform: Arc<T>,
    options: ProcessorOptions,
}

impl<T: Transform> ChunkProcessor<T> {
    pub fn new(
        source: Arc<dyn Source>,
        destination: Arc<dyn Destination>,
        leases: LeaseTable,
        transform: Arc<T>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            source,
            destination,
            leases,
            transform,
            options,
        }
    }

    /// Run a chunk the caller has already claimed.
    ///
    /// Record and flush failures stay inside the outcome; only lease-table
    /// failures come back as `Err`.
    pub async fn process(&self, chunk: &Chunk, worker: &WorkerId) -> Result<ChunkOutcome> {
        let span = start_chunk_span(chunk, worker);
        let started = Instant::now();

        let outcome = self.run(chunk, worker).instrument(span.clone()).await?;

        record_outcome(&span, outcome.name());
        metrics::chunk_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("outcome", outcome.name())],
        );
        Ok(outcome)
    }

    async fn run(&self, chunk: &Chunk, worker: &WorkerId) -> Result<ChunkOutcome> {
        let mut context = match self
            .transform
            .init(self.source.as_ref(), self.destination.as_read())
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "init hook failed; chunk aborted");
                self.leases
                    .record_event(
                        &chunk.start,
                        Some(worker),
                        ChunkEventKind::InitFailed {
                            error: e.to_string(),
                        },
                    )
                    .await?;
                return Ok(ChunkOutcome::InitFailed {
                    error: e.to_string(),
                });
            }
        };

        let mut tally = Tally::default();
        let mut writer = BulkWriter::new(self.destination.clone(), self.options.flush_threshold);

        if !self.leases.is_still_owner(&chunk.start, worker).await? {
            return self.lost(chunk, worker, &tally, &mut writer).await;
        }
        let mut last_check = self.leases.now();

        let range = chunk.range();
        let mut cursor = match self.source.open_cursor(Some(&range), self.options.sort).await {
            Ok(cursor) => cursor,
            Err(e) => return self.source_failed(chunk, worker, &tally, e).await,
        };

        loop {
            let batch = match cursor.next_batch().await {
                Ok(batch) => batch,
                Err(e) => {
                    writer.discard();
                    return self.source_failed(chunk, worker, &tally, e).await;
                }
            };
            if batch.is_empty() {
                break;
            }

            for record in &batch {
                if self.recheck_due(last_check) {
                    if !self.leases.is_still_owner(&chunk.start, worker).await? {
                        return self.lost(chunk, worker, &tally, &mut writer).await;
                    }
                    last_check = self.leases.now();
                }

                match self.transform.apply(&mut context, record) {
                    Ok(output) => {
                        tally.good += 1;
                        metrics::records_processed().add(1, &[KeyValue::new("result", "good")]);
                        let Some(output) = output else { continue };
                        if !writer.push(output) {
                            continue;
                        }
                        if !self.leases.is_still_owner(&chunk.start, worker).await? {
                            return self.lost(chunk, worker, &tally, &mut writer).await;
                        }
                        last_check = self.leases.now();
                        info!(
                            records = writer.pending_len(),
                            bytes = writer.pending_bytes(),
                            "flushing chunk output"
                        );
                        if let Some(abort) = self.flush(chunk, worker, &mut tally, &mut writer).await? {
                            return Ok(abort);
                        }
                    }
                    Err(e) => {
                        tally.failed += 1;
                        metrics::records_processed().add(1, &[KeyValue::new("result", "failed")]);
                        let key = record.key.clone();
                        warn!(
                            key = key.as_ref().map(ToString::to_string).unwrap_or_default(),
                            error = %e,
                            "transform failed; record skipped"
                        );
                        self.leases
                            .record_event(
                                &chunk.start,
                                Some(worker),
                                ChunkEventKind::TransformFailed {
                                    key,
                                    error: e.to_string(),
                                },
                            )
                            .await?;
                    }
                }
            }
        }

        if !self.leases.is_still_owner(&chunk.start, worker).await? {
            return self.lost(chunk, worker, &tally, &mut writer).await;
        }
        if writer.pending_len() == 0 {
            info!("no bulk writes to do at end of chunk");
        }
        if let Some(abort) = self.flush(chunk, worker, &mut tally, &mut writer).await? {
            return Ok(abort);
        }

        Ok(ChunkOutcome::Completed {
            good: tally.good,
            failed: tally.failed,
            written: tally.written,
            dropped: tally.dropped,
        })
    }

    fn recheck_due(&self, last_check: DateTime<Utc>) -> bool {
        self.options
            .recheck_interval
            .is_some_and(|interval| self.leases.now() - last_check >= to_delta(interval))
    }

    /// Flush and account. `Some` means the chunk must abort.
    async fn flush(
        &self,
        chunk: &Chunk,
        worker: &WorkerId,
        tally: &mut Tally,
        writer: &mut BulkWriter,
    ) -> Result<Option<ChunkOutcome>> {
        match writer.flush().await {
            FlushOutcome::Empty => Ok(None),
            FlushOutcome::Written { records, .. } => {
                tally.written += records;
                Ok(None)
            }
            FlushOutcome::Failed { records, error } => {
                tally.dropped += records;
                self.leases
                    .record_event(
                        &chunk.start,
                        Some(worker),
                        ChunkEventKind::WriteFailed {
                            records,
                            error: error.to_string(),
                        },
                    )
                    .await?;
                match self.options.write_failure {
                    WriteFailurePolicy::BestEffort => Ok(None),
                    WriteFailurePolicy::FailChunk => Ok(Some(ChunkOutcome::WriteFailed {
                        good: tally.good,
                        error: error.to_string(),
                    })),
                }
            }
        }
    }

    async fn lost(
        &self,
        chunk: &Chunk,
        worker: &WorkerId,
        tally: &Tally,
        writer: &mut BulkWriter,
    ) -> Result<ChunkOutcome> {
        let discarded = writer.discard();
        info!(discarded, "chunk lost to another worker; pending output discarded");
        self.leases
            .record_event(&chunk.start, Some(worker), ChunkEventKind::LostOwnership)
            .await?;
        Ok(ChunkOutcome::LostOwnership {
            good: tally.good,
            discarded,
        })
    }

    async fn source_failed(
        &self,
        chunk: &Chunk,
        worker: &WorkerId,
        tally: &Tally,
        error: crate::error::Error,
    ) -> Result<ChunkOutcome> {
        warn!(error = %error, "source read failed; chunk abandoned");
        self.leases
            .record_event(
                &chunk.start,
                Some(worker),
                ChunkEventKind::SourceFailed {
                    error: error.to_string(),
                },
            )
            .await?;
        Ok(ChunkOutcome::SourceFailed {
            good: tally.good,
            error: error.to_string(),
        })
    }
}
