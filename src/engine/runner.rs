//! Ways to launch a pool of workers.
//!
//! Workers share nothing but the lease table, so the same claim loop runs
//! as tokio tasks, one after another, or as separate OS processes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::processor::ChunkProcessor;
use super::worker::{Worker, WorkerSummary};
use crate::error::{Error, Result};
use crate::lease::LeaseTable;
use crate::transform::Transform;

/// Environment variable carrying a child worker's index.
pub const WORKER_INDEX_ENV: &str = "CHUNKMAP_WORKER_INDEX";

/// Builds identical workers bound to one job.
pub struct WorkerFactory<T: Transform> {
    leases: LeaseTable,
    processor: Arc<ChunkProcessor<T>>,
    standby: Option<Duration>,
}

impl<T: Transform> Clone for WorkerFactory<T> {
    fn clone(&self) -> Self {
        Self {
            leases: self.leases.clone(),
            processor: Arc::clone(&self.processor),
            standby: self.standby,
        }
    }
}

impl<T: Transform> WorkerFactory<T> {
    pub fn new(
        leases: LeaseTable,
        processor: Arc<ChunkProcessor<T>>,
        standby: Option<Duration>,
    ) -> Self {
        Self {
            leases,
            processor,
            standby,
        }
    }

    pub fn worker(&self) -> Worker<T> {
        let worker = Worker::new(self.leases.clone(), Arc::clone(&self.processor));
        match self.standby {
            Some(interval) => worker.with_standby(interval),
            None => worker,
        }
    }
}

#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// Run `count` workers to completion.
    ///
    /// Summaries are returned for workers the runner can observe; runners
    /// that launch separate processes return none.
    async fn run<T: Transform + 'static>(
        &self,
        count: usize,
        factory: &WorkerFactory<T>,
    ) -> Result<Vec<WorkerSummary>>;
}

/// Workers as concurrent tokio tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessRunner;

#[async_trait]
impl WorkerRunner for InProcessRunner {
    async fn run<T: Transform + 'static>(
        &self,
        count: usize,
        factory: &WorkerFactory<T>,
    ) -> Result<Vec<WorkerSummary>> {
        let mut set = JoinSet::new();
        for _ in 0..count {
            set.spawn(factory.worker().run());
        }
        info!(count, "workers spawned");

        let mut summaries = Vec::with_capacity(count);
        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(summary)) => summaries.push(summary),
                Ok(Err(e)) => {
                    error!(error = %e, "worker failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "worker task panicked");
                    first_error.get_or_insert(Error::Other(format!("worker task failed: {e}")));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }
}

/// Workers one after another on the calling task. The first drains the
/// queue; later ones find nothing to claim. Useful where spawning is not.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialRunner;

#[async_trait]
impl WorkerRunner for SequentialRunner {
    async fn run<T: Transform + 'static>(
        &self,
        count: usize,
        factory: &WorkerFactory<T>,
    ) -> Result<Vec<WorkerSummary>> {
        let mut summaries = Vec::with_capacity(count);
        for _ in 0..count {
            summaries.push(factory.worker().run().await?);
        }
        Ok(summaries)
    }
}

/// Workers as child processes of `program`. Each child is expected to run
/// one worker loop against the same lease table and exit.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl WorkerRunner for ProcessRunner {
    async fn run<T: Transform + 'static>(
        &self,
        count: usize,
        _factory: &WorkerFactory<T>,
    ) -> Result<Vec<WorkerSummary>> {
        let mut children = Vec::with_capacity(count);
        for index in 0..count {
            let child = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .env(WORKER_INDEX_ENV, index.to_string())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    Error::WorkerProcess(format!(
                        "failed to spawn worker {index} ({}): {e}",
                        self.program.display()
                    ))
                })?;
            info!(index, pid = child.id().unwrap_or_default(), "worker process spawned");
            children.push(child);
        }

        let mut failures = Vec::new();
        for (index, mut child) in children.into_iter().enumerate() {
            let status = child.wait().await?;
            if status.success() {
                info!(index, "worker process exited");
            } else {
                error!(index, %status, "worker process failed");
                failures.push(format!("worker {index}: {status}"));
            }
        }

        if failures.is_empty() {
            Ok(Vec::new())
        } else {
            Err(Error::WorkerProcess(failures.join("; ")))
        }
    }
}
