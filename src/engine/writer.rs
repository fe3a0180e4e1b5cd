//! Batched destination writes.
//!
//! Outputs accumulate until their serialized size passes a threshold, then
//! go out as one bulk submission. Keyed outputs are upserts and may be
//! replayed safely; keyless outputs are inserts and duplicate on replay.
//! A failed submission is reported and the batch dropped, never retried.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, error};

use crate::model::OutputRecord;
use crate::store::Destination;
use crate::telemetry::metrics;

/// Default flush threshold in serialized bytes.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10_000_000;

/// Result of one flush.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing pending.
    Empty,
    Written { records: usize, bytes: usize },
    /// The store rejected the batch; it has been dropped.
    Failed {
        records: usize,
        error: crate::error::Error,
    },
}

pub struct BulkWriter {
    destination: Arc<dyn Destination>,
    threshold: usize,
    pending: Vec<OutputRecord>,
    pending_bytes: usize,
}

impl BulkWriter {
    pub fn new(destination: Arc<dyn Destination>, threshold: usize) -> Self {
        Self {
            destination,
            threshold,
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Queue an output. Returns true once the batch is over the threshold.
    pub fn push(&mut self, record: OutputRecord) -> bool {
        self.pending_bytes += record.encoded_len();
        self.pending.push(record);
        self.pending_bytes > self.threshold
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Throw away everything pending.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.pending_bytes = 0;
        dropped
    }

    /// Submit the pending batch and start a new one, whatever the result.
    pub async fn flush(&mut self) -> FlushOutcome {
        if self.pending.is_empty() {
            return FlushOutcome::Empty;
        }
        let batch = std::mem::take(&mut self.pending);
        let bytes = std::mem::take(&mut self.pending_bytes);
        let records = batch.len();

        match self.destination.write_batch(&batch).await {
            Ok(()) => {
                debug!(records, bytes, "bulk write submitted");
                metrics::bulk_writes().add(1, &[KeyValue::new("result", "ok")]);
                metrics::bytes_written().add(bytes as u64, &[]);
                FlushOutcome::Written { records, bytes }
            }
            Err(e) => {
                error!(records, bytes, error = %e, "bulk write failed; batch dropped");
                metrics::bulk_writes().add(1, &[KeyValue::new("result", "error")]);
                FlushOutcome::Failed { records, error: e }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DestinationRead, MemoryDestination};
    use serde_json::json;

    #[tokio::test]
    async fn push_reports_threshold_crossing() {
        let dest = Arc::new(MemoryDestination::new());
        let mut writer = BulkWriter::new(dest.clone(), 40);

        assert!(!writer.push(OutputRecord::keyed(1, json!({"v": 1}))));
        let mut crossed = false;
        for i in 2..10 {
            if writer.push(OutputRecord::keyed(i, json!({"v": i}))) {
                crossed = true;
                break;
            }
        }
        assert!(crossed);
        assert!(writer.pending_bytes() > 40);

        match writer.flush().await {
            FlushOutcome::Written { records, .. } => assert_eq!(records, writer_len(&dest).await),
            other => panic!("expected Written, got {other:?}"),
        }
        assert_eq!(writer.pending_len(), 0);
        assert_eq!(writer.pending_bytes(), 0);
    }

    #[tokio::test]
    async fn failed_flush_drops_the_batch() {
        let dest = Arc::new(MemoryDestination::new());
        dest.fail_next_writes(1);
        let mut writer = BulkWriter::new(dest.clone(), DEFAULT_FLUSH_THRESHOLD);
        writer.push(OutputRecord::unkeyed(json!({"v": 1})));

        assert!(matches!(
            writer.flush().await,
            FlushOutcome::Failed { records: 1, .. }
        ));
        assert_eq!(writer.pending_len(), 0);
        assert!(matches!(writer.flush().await, FlushOutcome::Empty));
        assert_eq!(dest.count().await.unwrap(), 0);
    }

    async fn writer_len(dest: &MemoryDestination) -> usize {
        dest.count().await.unwrap() as usize
    }
}
