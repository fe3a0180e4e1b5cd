//! A Postgres table as a record source.
//!
//! Records are whole rows rendered with `to_jsonb`. Chunk reads go through a
//! server-side cursor inside a read transaction, which stays valid however
//! slowly the consumer pulls from it.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::{Db, quote_ident};
use crate::error::Result;
use crate::model::{Key, KeyRange, SortOrder, SourceRecord};
use crate::store::{CURSOR_BATCH_SIZE, RecordCursor, Source};

#[derive(Clone)]
pub struct PgSource {
    pool: sqlx::PgPool,
    table: String,
    key: String,
    filter: Option<String>,
}

impl PgSource {
    /// Read `table`, partitioned by `key_column`.
    pub fn new(db: &Db, table: &str, key_column: &str) -> Result<Self> {
        Ok(Self {
            pool: db.pool().clone(),
            table: quote_ident(table)?,
            key: format!("t.{}", quote_ident(key_column)?),
            filter: None,
        })
    }

    /// Restrict every read to rows matching an SQL boolean expression over
    /// the table (aliased `t`).
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn where_clause(&self, range: Option<&KeyRange>, after: Option<&Key>) -> String {
        let mut conditions = Vec::new();
        if let Some(ref filter) = self.filter {
            conditions.push(format!("({filter})"));
        }
        if let Some(range) = range {
            conditions.push(format!(
                "{key} BETWEEN {} AND {}",
                key_literal(&range.start),
                key_literal(&range.end),
                key = self.key
            ));
        }
        if let Some(after) = after {
            conditions.push(format!("{} > {}", self.key, key_literal(after)));
        }
        if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        }
    }

    fn order_by(&self, order: SortOrder) -> String {
        let nulls = match order {
            SortOrder::Ascending => "NULLS FIRST",
            SortOrder::Descending => "NULLS LAST",
        };
        format!(" ORDER BY {} {} {nulls}", self.key, order.as_sql())
    }
}

/// Render a key as an SQL literal compared against the key column.
fn key_literal(key: &Key) -> String {
    match key {
        Key::Int(i) => i.to_string(),
        Key::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

#[async_trait]
impl Source for PgSource {
    async fn count(&self) -> Result<u64> {
        let sql = format!("SELECT count(*) FROM {} t{}", self.table, self.where_clause(None, None));
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(row.0 as u64)
    }

    async fn keys_after(&self, after: Option<&Key>, limit: usize) -> Result<Vec<Option<Key>>> {
        let sql = format!(
            "SELECT to_jsonb({key}) FROM {table} t{where_}{order} LIMIT {limit}",
            key = self.key,
            table = self.table,
            where_ = self.where_clause(None, after),
            order = self.order_by(SortOrder::Ascending),
        );
        let rows: Vec<(Option<Value>,)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(value,)| match value {
                Some(v) => Key::from_json(&v),
                None => Ok(None),
            })
            .collect()
    }

    async fn count_range(&self, range: &KeyRange) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM {} t{}",
            self.table,
            self.where_clause(Some(range), None)
        );
        let row: (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(row.0 as u64)
    }

    async fn open_cursor(
        &self,
        range: Option<&KeyRange>,
        order: SortOrder,
    ) -> Result<Box<dyn RecordCursor>> {
        let name = format!("chunkmap_{}", Uuid::new_v4().simple());
        let declare = format!(
            "DECLARE {name} NO SCROLL CURSOR FOR SELECT to_jsonb({key}), to_jsonb(t) FROM {table} t{where_}{order}",
            key = self.key,
            table = self.table,
            where_ = self.where_clause(range, None),
            order = self.order_by(order),
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&declare)
            .persistent(false)
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgCursor {
            tx,
            fetch: format!("FETCH {CURSOR_BATCH_SIZE} FROM {name}"),
            exhausted: false,
        }))
    }
}

struct PgCursor {
    tx: Transaction<'static, Postgres>,
    fetch: String,
    exhausted: bool,
}

#[async_trait]
impl RecordCursor for PgCursor {
    async fn next_batch(&mut self) -> Result<Vec<SourceRecord>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let rows: Vec<(Option<Value>, Value)> = sqlx::query_as(&self.fetch)
            .persistent(false)
            .fetch_all(&mut *self.tx)
            .await?;
        self.exhausted = rows.is_empty();

        rows.into_iter()
            .map(|(key, document)| {
                let key = match key {
                    Some(v) => Key::from_json(&v)?,
                    None => None,
                };
                Ok(SourceRecord { key, document })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_keys_are_escaped() {
        assert_eq!(key_literal(&Key::Int(-3)), "-3");
        assert_eq!(key_literal(&Key::from("o'brien")), "'o''brien'");
    }
}
