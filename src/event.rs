//! Append-only chunk event log.
//!
//! Failures that never escape a chunk (bad records, dropped batches, lost
//! leases) and supervisor reclaims are recorded here, keyed by chunk start.
//! Tracing is the live voice; this log is what an operator reads afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Key, WorkerId};

/// A recorded event against one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEvent {
    /// Start key of the chunk this event belongs to.
    pub chunk: Key,
    pub timestamp: DateTime<Utc>,
    /// Worker that observed the event. `None` for supervisor actions.
    pub worker: Option<WorkerId>,
    pub kind: ChunkEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkEventKind {
    TransformFailed {
        key: Option<Key>,
        error: String,
    },
    WriteFailed {
        records: usize,
        error: String,
    },
    InitFailed {
        error: String,
    },
    SourceFailed {
        error: String,
    },
    LostOwnership,
    Reclaimed {
        owner: Option<WorkerId>,
        held_secs: i64,
    },
    /// Stored payload this version does not recognise.
    #[serde(other)]
    Unknown,
}

impl ChunkEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkEventKind::TransformFailed { .. } => "transform_failed",
            ChunkEventKind::WriteFailed { .. } => "write_failed",
            ChunkEventKind::InitFailed { .. } => "init_failed",
            ChunkEventKind::SourceFailed { .. } => "source_failed",
            ChunkEventKind::LostOwnership => "lost_ownership",
            ChunkEventKind::Reclaimed { .. } => "reclaimed",
            ChunkEventKind::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_event_type_decodes_as_unknown() {
        let kind: ChunkEventKind =
            serde_json::from_str(r#"{"type":"quantum_entangled","qubit":"q42"}"#).unwrap();
        assert_eq!(kind, ChunkEventKind::Unknown);
    }

    #[test]
    fn event_kind_round_trips_with_tag() {
        let kind = ChunkEventKind::WriteFailed {
            records: 3,
            error: "connection reset".into(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "write_failed");
        let back: ChunkEventKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }
}
