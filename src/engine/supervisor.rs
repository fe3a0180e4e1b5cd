//! Supervisor: progress reporting and stale-lease reclamation.
//!
//! Polls the lease table until every chunk is done. Each tick logs progress
//! with an ETA, reports how long each working chunk has been held, and
//! reopens chunks held past the lease timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::Result;
use crate::lease::{LeaseTable, Progress};
use crate::model::{Chunk, ChunkState};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum time a chunk may stay working before it is reopened.
    pub lease_timeout: Duration,
    /// Time between ticks.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// One supervisor pass.
#[derive(Debug, Clone)]
pub struct Tick {
    pub progress: Progress,
    /// Chunks reopened on this pass, as they were before reopening.
    pub reclaimed: Vec<Chunk>,
}

pub struct Supervisor {
    leases: LeaseTable,
    config: SupervisorConfig,
    shutdown: Arc<Notify>,
}

impl Clone for Supervisor {
    fn clone(&self) -> Self {
        Self {
            leases: self.leases.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Supervisor {
    pub fn new(leases: LeaseTable, config: SupervisorConfig) -> Self {
        Self {
            leases,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Stop the loop at its next wait.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Tick until no chunk is left undone.
    ///
    /// Returns `true` when the job completed, `false` when shut down first.
    pub async fn run(&self) -> Result<bool> {
        info!(
            lease_timeout_secs = self.config.lease_timeout.as_secs(),
            poll_secs = self.config.poll_interval.as_secs(),
            "supervisor started"
        );

        while self.leases.remaining_count().await? > 0 {
            self.tick().await?;

            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("supervisor shutting down");
                    return Ok(false);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("all chunks done");
        Ok(true)
    }

    pub async fn tick(&self) -> Result<Tick> {
        let progress = self.leases.progress().await?;
        info!(done = progress.done, total = progress.total, "{progress}");

        let now = self.leases.now();
        for chunk in self.leases.chunks(Some(ChunkState::Working)).await? {
            let held_secs = chunk
                .claimed_at
                .map(|t| (now - t).num_seconds())
                .unwrap_or_default();
            debug!(
                start = %chunk.start,
                owner = chunk.owner.as_ref().map(|o| o.0.as_str()).unwrap_or("none"),
                held_secs,
                "chunk in progress"
            );
        }

        let reclaimed = self.leases.reclaim_stale(self.config.lease_timeout).await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed stale chunks");
        }
        Ok(Tick {
            progress,
            reclaimed,
        })
    }
}
