//! Metric instrument factories for chunkmap.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("chunkmap")
}

/// Counter: successful chunk claims.
pub fn chunks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("chunkmap.chunks.claimed")
        .with_description("Number of chunks claimed by workers")
        .build()
}

/// Counter: chunk state transitions.
/// Labels: `from`, `to`.
pub fn chunk_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("chunkmap.chunks.state_transitions")
        .with_description("Number of chunk state transitions")
        .build()
}

/// Counter: source records run through the transform.
/// Labels: `result` ("good" | "failed").
pub fn records_processed() -> Counter<u64> {
    meter()
        .u64_counter("chunkmap.records.processed")
        .with_description("Number of source records transformed")
        .build()
}

/// Counter: bulk write submissions.
/// Labels: `result` ("ok" | "error").
pub fn bulk_writes() -> Counter<u64> {
    meter()
        .u64_counter("chunkmap.writes.bulk")
        .with_description("Number of bulk write submissions")
        .build()
}

/// Counter: bytes of output submitted to the destination.
pub fn bytes_written() -> Counter<u64> {
    meter()
        .u64_counter("chunkmap.writes.bytes")
        .with_description("Serialized bytes of output submitted")
        .with_unit("By")
        .build()
}

/// Histogram: wall time spent on one chunk.
/// Labels: `outcome`.
pub fn chunk_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("chunkmap.chunk.duration_ms")
        .with_description("Chunk processing duration in milliseconds")
        .with_unit("ms")
        .build()
}
