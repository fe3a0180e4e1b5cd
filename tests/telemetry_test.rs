//! Integration tests for telemetry initialization and span helpers.

use chunkmap::model::{Chunk, KeyRange, WorkerId};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so this may
    // return Err if another test got there first; that is acceptable.
    let config = chunkmap::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "chunkmap-test".to_string(),
        default_level: "debug".to_string(),
    };
    let _guard = chunkmap::telemetry::init_telemetry(config);
}

#[test]
fn chunk_span_creates_and_records_outcome() {
    let chunk = Chunk::open(KeyRange::new(1, 100), 100);
    let span = chunkmap::telemetry::chunk::start_chunk_span(&chunk, &WorkerId::from("w1"));
    chunkmap::telemetry::chunk::record_outcome(&span, "completed");
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;
    chunkmap::telemetry::metrics::chunks_claimed().add(1, &[]);
    chunkmap::telemetry::metrics::records_processed().add(3, &[KeyValue::new("result", "good")]);
    chunkmap::telemetry::metrics::chunk_duration_ms()
        .record(12.5, &[KeyValue::new("outcome", "completed")]);
}
