//! Execution engine: chunk processing, the worker claim loop, supervision,
//! and worker launchers.

pub mod processor;
pub mod runner;
pub mod supervisor;
pub mod worker;
pub mod writer;

pub use processor::{ChunkOutcome, ChunkProcessor, ProcessorOptions, WriteFailurePolicy};
pub use runner::{
    InProcessRunner, ProcessRunner, SequentialRunner, WORKER_INDEX_ENV, WorkerFactory,
    WorkerRunner,
};
pub use supervisor::{Supervisor, SupervisorConfig, Tick};
pub use worker::{Worker, WorkerSummary};
pub use writer::{BulkWriter, DEFAULT_FLUSH_THRESHOLD, FlushOutcome};
