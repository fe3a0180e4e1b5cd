//! Typed configuration.
//!
//! Process settings come from environment variables, loaded once at startup
//! and failing fast if required ones are missing. Job definitions come from
//! TOML files (see [`job_file`]).

pub mod job_file;
pub mod secrets;

pub use job_file::JobFile;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    /// Lease table and destination database.
    pub database_url: SecretString,
    /// Source database, when it is not the main one.
    pub source_database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            source_database_url: std::env::var("SOURCE_DATABASE_URL")
                .ok()
                .map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
