//! Error types for chunkmap.

use thiserror::Error;

use crate::model::ChunkState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("chunk not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ChunkState, to: ChunkState },

    /// Partitioning hit a boundary it cannot represent. Fatal to planning.
    #[error("partitioning failed: {0}")]
    Initialization(String),

    #[error("invalid partition key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(String),

    #[error("worker process failed: {0}")]
    WorkerProcess(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
