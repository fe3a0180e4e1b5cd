//! Postgres backends: connection pool, migrations, lease store, source and
//! destination tables.

pub mod destination;
pub mod lease;
pub mod source;

pub use destination::PgDestination;
pub use lease::PgLeaseStore;
pub use source::PgSource;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Database handle. Owns the connection pool shared by every backend built
/// from it.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with a pool of at most `max_connections`. Size it with
    /// [`Db::connections_for`] when workers share the pool.
    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool size for `parallelism` in-process workers. Each worker holds one
    /// connection for its open cursor and needs a second one for lease checks,
    /// writes and events while the cursor is open. Two more cover the
    /// supervisor and planning.
    pub fn connections_for(parallelism: usize) -> u32 {
        let wanted = parallelism.saturating_mul(2).saturating_add(2);
        u32::try_from(wanted)
            .unwrap_or(u32::MAX)
            .max(DEFAULT_MAX_CONNECTIONS)
    }

    /// Run all pending migrations (lease and event tables).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Quote an SQL identifier, allowing `schema.table`.
pub(crate) fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(Error::Config("empty SQL identifier".to_string()));
    }
    Ok(name
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_per_part() {
        assert_eq!(quote_ident("events").unwrap(), "\"events\"");
        assert_eq!(quote_ident("raw.events").unwrap(), "\"raw\".\"events\"");
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn pool_grows_with_parallelism() {
        assert_eq!(Db::connections_for(0), 10);
        assert_eq!(Db::connections_for(4), 10);
        assert_eq!(Db::connections_for(12), 26);
        assert_eq!(Db::connections_for(usize::MAX), u32::MAX);
    }
}
