//! Chunk execution span helpers.

use tracing::Span;

use crate::model::{Chunk, WorkerId};

/// Start a span covering one chunk's processing.
///
/// `chunk.outcome` is declared empty and filled by [`record_outcome`].
pub fn start_chunk_span(chunk: &Chunk, worker: &WorkerId) -> Span {
    tracing::info_span!(
        "chunk.process",
        "chunk.start" = %chunk.start,
        "chunk.end" = %chunk.end,
        "chunk.total" = chunk.total,
        "worker.id" = %worker,
        "chunk.outcome" = tracing::field::Empty,
    )
}

pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("chunk.outcome", outcome);
}
