//! Job definitions on disk.
//!
//! ```toml
//! [job]
//! name = "orders-backfill"
//! parallelism = 8
//! lease_timeout_secs = 300
//!
//! [source]
//! table = "orders"
//! partition_key = "id"
//! filter = "status <> 'void'"
//!
//! [destination]
//! table = "orders_by_id"
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::job::JobOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    pub job: JobSection,
    pub source: SourceSection,
    pub destination: DestinationSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSection {
    /// Scopes the job's lease records.
    pub name: String,
    #[serde(flatten)]
    pub options: JobOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSection {
    pub table: String,
    pub partition_key: String,
    /// SQL boolean expression over the source table.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationSection {
    pub table: String,
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobMode;

    #[test]
    fn parses_job_sections_with_defaults() {
        let file = JobFile::parse(
            r#"
            [job]
            name = "backfill"
            parallelism = 3
            mode = "init_only"

            [source]
            table = "raw.orders"
            partition_key = "id"

            [destination]
            table = "orders_copy"
            "#,
        )
        .unwrap();

        assert_eq!(file.job.name, "backfill");
        assert_eq!(file.job.options.parallelism, Some(3));
        assert_eq!(file.job.options.mode, JobMode::InitOnly);
        assert_eq!(file.job.options.lease_timeout_secs, 120);
        assert!(file.source.filter.is_none());
        assert_eq!(file.destination.table, "orders_copy");
    }

    #[test]
    fn missing_sections_are_config_errors() {
        let err = JobFile::parse("[job]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
