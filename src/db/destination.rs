//! A Postgres table as a destination.
//!
//! Rows are `(seq, id, doc)`: `id` is the output identity (unique when
//! present), `doc` the JSON fields. Keyed writes merge their fields into any
//! existing document; keyless writes always add a row.

use async_trait::async_trait;
use serde_json::Value;

use super::{Db, quote_ident};
use crate::error::Result;
use crate::model::{Key, OutputRecord};
use crate::store::{Destination, DestinationRead};

#[derive(Clone)]
pub struct PgDestination {
    pool: sqlx::PgPool,
    table: String,
}

impl PgDestination {
    pub fn new(db: &Db, table: &str) -> Result<Self> {
        Ok(Self {
            pool: db.pool().clone(),
            table: quote_ident(table)?,
        })
    }

    /// Create the destination table if it does not exist.
    pub async fn ensure_table(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 seq BIGSERIAL PRIMARY KEY,
                 id  JSONB UNIQUE,
                 doc JSONB NOT NULL DEFAULT '{{}}'::JSONB
             )",
            self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DestinationRead for PgDestination {
    async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT count(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    async fn get(&self, id: &Key) -> Result<Option<Value>> {
        let row: Option<(Value,)> =
            sqlx::query_as(&format!("SELECT doc FROM {} WHERE id = $1", self.table))
                .bind(id.to_json())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(doc,)| doc))
    }
}

#[async_trait]
impl Destination for PgDestination {
    /// One transaction per batch: all of it lands or none of it does.
    async fn write_batch(&self, records: &[OutputRecord]) -> Result<()> {
        let upsert = format!(
            "INSERT INTO {} AS t (id, doc) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET doc = t.doc || EXCLUDED.doc",
            self.table
        );
        let insert = format!("INSERT INTO {} (doc) VALUES ($1)", self.table);

        let mut tx = self.pool.begin().await?;
        for record in records {
            let doc = Value::Object(record.fields.clone());
            match record.id {
                Some(ref id) => {
                    sqlx::query(&upsert)
                        .bind(id.to_json())
                        .bind(doc)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query(&insert).bind(doc).execute(&mut *tx).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query(&format!("TRUNCATE {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn as_read(&self) -> &dyn DestinationRead {
        self
    }
}
