//! Lease table in Postgres, shared by workers in any number of processes.
//!
//! Every transition is one conditional statement, so exclusivity rests on
//! row locks alone. Claims skip rows another transaction is already
//! claiming instead of waiting on them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::Db;
use crate::error::{Error, Result};
use crate::event::{ChunkEvent, ChunkEventKind};
use crate::lease::{LeaseStats, LeaseStore};
use crate::model::{Chunk, ChunkState, Key, WorkerId};

const CHUNK_COLUMNS: &str =
    "start_key, end_key, total, good, state, owner, claimed_at, finished_at";

/// Lease records for one named job.
#[derive(Clone)]
pub struct PgLeaseStore {
    pool: sqlx::PgPool,
    job: String,
}

impl PgLeaseStore {
    pub fn new(db: &Db, job: impl Into<String>) -> Self {
        Self {
            pool: db.pool().clone(),
            job: job.into(),
        }
    }

    pub fn job(&self) -> &str {
        &self.job
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_events WHERE job = $1")
            .bind(&self.job)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunk_leases WHERE job = $1")
            .bind(&self.job)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert(&self, chunk: &Chunk) -> Result<()> {
        sqlx::query(
            "INSERT INTO chunk_leases (job, start_key, end_key, total, good, state, owner, claimed_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&self.job)
        .bind(chunk.start.to_json())
        .bind(chunk.end.to_json())
        .bind(chunk.total as i64)
        .bind(chunk.good as i64)
        .bind(chunk.state.as_str())
        .bind(chunk.owner.as_ref().map(|o| o.0.as_str()))
        .bind(chunk.claimed_at)
        .bind(chunk.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_open(&self, owner: &WorkerId, now: DateTime<Utc>) -> Result<Option<Chunk>> {
        let row: Option<ChunkRow> = sqlx::query_as(&format!(
            "UPDATE chunk_leases SET state = 'working', owner = $2, claimed_at = $3
             WHERE job = $1 AND state = 'open' AND start_key = (
                 SELECT start_key FROM chunk_leases
                 WHERE job = $1 AND state = 'open'
                 ORDER BY start_key
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {CHUNK_COLUMNS}"
        ))
        .bind(&self.job)
        .bind(&owner.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChunkRow::try_into_chunk).transpose()
    }

    async fn get(&self, start: &Key) -> Result<Option<Chunk>> {
        let row: Option<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunk_leases WHERE job = $1 AND start_key = $2"
        ))
        .bind(&self.job)
        .bind(start.to_json())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChunkRow::try_into_chunk).transpose()
    }

    async fn complete(
        &self,
        start: &Key,
        good: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ChunkState>> {
        let prev: Option<(String,)> = sqlx::query_as(
            "UPDATE chunk_leases c SET state = 'done', owner = NULL, good = $3, finished_at = $4
             FROM (
                 SELECT start_key, state AS prev_state FROM chunk_leases
                 WHERE job = $1 AND start_key = $2 AND state <> 'done'
                 FOR UPDATE
             ) prev
             WHERE c.job = $1 AND c.start_key = prev.start_key AND c.state <> 'done'
             RETURNING prev.prev_state",
        )
        .bind(&self.job)
        .bind(start.to_json())
        .bind(good as i64)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((state,)) = prev {
            return state.parse().map(Some);
        }
        match self.get(start).await? {
            Some(_) => Ok(None),
            None => Err(Error::NotFound(start.to_string())),
        }
    }

    async fn reopen_claimed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            "UPDATE chunk_leases c SET state = 'open', owner = NULL
             FROM (
                 SELECT start_key, owner AS prev_owner FROM chunk_leases
                 WHERE job = $1 AND state = 'working' AND claimed_at < $2
                 FOR UPDATE
             ) prev
             WHERE c.job = $1 AND c.start_key = prev.start_key AND c.state = 'working'
             RETURNING c.start_key, c.end_key, c.total, c.good, 'working'::TEXT AS state,
                       prev.prev_owner AS owner, c.claimed_at, c.finished_at",
        )
        .bind(&self.job)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChunkRow::try_into_chunk).collect()
    }

    async fn count_not_done(&self) -> Result<u64> {
        let row: (i64,) =
            sqlx::query_as("SELECT count(*) FROM chunk_leases WHERE job = $1 AND state <> 'done'")
                .bind(&self.job)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0 as u64)
    }

    async fn list(&self, state: Option<ChunkState>) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunk_leases
             WHERE job = $1 AND ($2::TEXT IS NULL OR state = $2)
             ORDER BY start_key"
        ))
        .bind(&self.job)
        .bind(state.map(ChunkState::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChunkRow::try_into_chunk).collect()
    }

    async fn stats(&self) -> Result<LeaseStats> {
        let row: StatsRow = sqlx::query_as(
            "SELECT count(*) AS chunks,
                    count(*) FILTER (WHERE state = 'open') AS open,
                    count(*) FILTER (WHERE state = 'working') AS working,
                    count(*) FILTER (WHERE state = 'done') AS done,
                    COALESCE(sum(total), 0)::BIGINT AS records,
                    COALESCE(sum(good) FILTER (WHERE state = 'done'), 0)::BIGINT AS good,
                    min(finished_at) FILTER (WHERE state = 'done') AS first_finished,
                    max(finished_at) FILTER (WHERE state = 'done') AS last_finished
             FROM chunk_leases WHERE job = $1",
        )
        .bind(&self.job)
        .fetch_one(&self.pool)
        .await?;

        Ok(LeaseStats {
            chunks: row.chunks as u64,
            open: row.open as u64,
            working: row.working as u64,
            done: row.done as u64,
            records: row.records as u64,
            good: row.good as u64,
            first_finished: row.first_finished,
            last_finished: row.last_finished,
        })
    }

    async fn append_event(&self, event: &ChunkEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO chunk_events (job, start_key, at, worker, kind) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&self.job)
        .bind(event.chunk.to_json())
        .bind(event.timestamp)
        .bind(event.worker.as_ref().map(|w| w.0.as_str()))
        .bind(serde_json::to_value(&event.kind)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events(&self, start: &Key) -> Result<Vec<ChunkEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT start_key, at, worker, kind FROM chunk_events
             WHERE job = $1 AND start_key = $2
             ORDER BY seq",
        )
        .bind(&self.job)
        .bind(start.to_json())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ChunkRow {
    start_key: Value,
    end_key: Value,
    total: i64,
    good: i64,
    state: String,
    owner: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl ChunkRow {
    fn try_into_chunk(self) -> Result<Chunk> {
        Ok(Chunk {
            start: boundary(&self.start_key)?,
            end: boundary(&self.end_key)?,
            total: self.total as u64,
            good: self.good as u64,
            state: self.state.parse()?,
            owner: self.owner.map(WorkerId),
            claimed_at: self.claimed_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    chunks: i64,
    open: i64,
    working: i64,
    done: i64,
    records: i64,
    good: i64,
    first_finished: Option<DateTime<Utc>>,
    last_finished: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    start_key: Value,
    at: DateTime<Utc>,
    worker: Option<String>,
    kind: Value,
}

impl EventRow {
    fn try_into_event(self) -> Result<ChunkEvent> {
        let kind: ChunkEventKind = serde_json::from_value(self.kind)?;
        Ok(ChunkEvent {
            chunk: boundary(&self.start_key)?,
            timestamp: self.at,
            worker: self.worker.map(WorkerId),
            kind,
        })
    }
}

fn boundary(value: &Value) -> Result<Key> {
    Key::from_json(value)?.ok_or_else(|| Error::InvalidKey("null chunk boundary".to_string()))
}
