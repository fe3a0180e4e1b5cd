//! Job submission: options, phase orchestration and direct mode.
//!
//! A job is planned once, processed by any number of workers, and watched
//! by a supervisor until every chunk is done. Each phase can also run on
//! its own, so planning, processing and supervision may live in different
//! processes that share only the lease table.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{
    ChunkProcessor, DEFAULT_FLUSH_THRESHOLD, ProcessorOptions, Supervisor, SupervisorConfig,
    WorkerFactory, WorkerRunner, WorkerSummary, WriteFailurePolicy,
};
use crate::error::Result;
use crate::lease::LeaseTable;
use crate::model::SortOrder;
use crate::planner::{PartitionPlanner, Plan};
use crate::store::{Destination, Source};
use crate::transform::Transform;

/// Which phases a submission performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Plan, process and (if `wait_done`) supervise.
    #[default]
    Full,
    /// Plan only.
    InitOnly,
    /// Process (and if `wait_done` supervise) an existing plan.
    ProcessOnly,
    /// Supervise an existing plan.
    ManageOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Worker count. `None` runs the job unchunked in the calling task.
    pub parallelism: Option<usize>,
    pub chunk_size: Option<usize>,
    pub sort: SortOrder,
    pub lease_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Empty the destination before planning.
    pub reset_destination: bool,
    pub mode: JobMode,
    /// Supervise until complete after launching workers.
    pub wait_done: bool,
    pub flush_threshold_bytes: usize,
    pub recheck_interval_secs: Option<u64>,
    pub write_failure: WriteFailurePolicy,
    /// Keep idle workers polling for reclaimed chunks.
    pub standby: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            parallelism: None,
            chunk_size: None,
            sort: SortOrder::Ascending,
            lease_timeout_secs: 120,
            poll_interval_secs: 60,
            reset_destination: false,
            mode: JobMode::Full,
            wait_done: true,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD,
            recheck_interval_secs: None,
            write_failure: WriteFailurePolicy::BestEffort,
            standby: false,
        }
    }
}

impl JobOptions {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn recheck_interval(&self) -> Option<Duration> {
        self.recheck_interval_secs.map(Duration::from_secs)
    }

    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            sort: self.sort,
            flush_threshold: self.flush_threshold_bytes,
            recheck_interval: self.recheck_interval(),
            write_failure: self.write_failure,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            lease_timeout: self.lease_timeout(),
            poll_interval: self.poll_interval(),
        }
    }
}

/// Totals for an unchunked run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectSummary {
    pub good: u64,
    pub failed: u64,
    pub written: u64,
    pub write_failures: u64,
}

#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub plan: Option<Plan>,
    pub workers: Vec<WorkerSummary>,
    pub direct: Option<DirectSummary>,
    /// Every chunk was observed done before returning.
    pub completed: bool,
}

pub struct Job<T: Transform> {
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    leases: LeaseTable,
    transform: Arc<T>,
    options: JobOptions,
}

impl<T: Transform + 'static> Job<T> {
    pub fn new(
        transform: T,
        source: Arc<dyn Source>,
        destination: Arc<dyn Destination>,
        leases: LeaseTable,
        options: JobOptions,
    ) -> Self {
        Self {
            source,
            destination,
            leases,
            transform: Arc::new(transform),
            options,
        }
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.leases.clone(), self.options.supervisor_config())
    }

    pub fn worker_factory(&self) -> WorkerFactory<T> {
        let processor = ChunkProcessor::new(
            Arc::clone(&self.source),
            Arc::clone(&self.destination),
            self.leases.clone(),
            Arc::clone(&self.transform),
            self.options.processor_options(),
        );
        let standby = self.options.standby.then(|| self.options.poll_interval());
        WorkerFactory::new(self.leases.clone(), Arc::new(processor), standby)
    }

    /// Reset the destination if asked, then build a fresh work queue.
    pub async fn plan(&self, parallelism: usize) -> Result<Plan> {
        if self.options.reset_destination {
            info!("clearing destination before planning");
            self.destination.clear().await?;
        }
        PartitionPlanner::new(self.source.as_ref(), &self.leases)
            .plan_for(parallelism, self.options.chunk_size)
            .await
    }

    /// Supervise until every chunk is done.
    pub async fn wait_for_completion(&self) -> Result<bool> {
        self.supervisor().run().await
    }

    /// Run the phases selected by the job's options.
    pub async fn run<R: WorkerRunner>(&self, runner: &R) -> Result<JobReport> {
        let mut report = JobReport::default();

        let Some(parallelism) = self.options.parallelism else {
            report.direct = Some(self.run_direct().await?);
            report.completed = true;
            return Ok(report);
        };

        if self.options.mode == JobMode::ManageOnly {
            report.completed = self.wait_for_completion().await?;
            return Ok(report);
        }

        if self.options.mode != JobMode::ProcessOnly {
            report.plan = Some(self.plan(parallelism).await?);
        }
        if self.options.mode == JobMode::InitOnly {
            return Ok(report);
        }

        let factory = self.worker_factory();
        if self.options.wait_done {
            let supervisor = self.supervisor();
            let stopper = supervisor.clone();
            let workers = async {
                let result = runner.run(parallelism, &factory).await;
                if result.is_err() {
                    stopper.shutdown();
                }
                result
            };
            let (workers, completed) = tokio::join!(workers, supervisor.run());
            report.workers = workers?;
            report.completed = completed?;
        } else {
            report.workers = runner.run(parallelism, &factory).await?;
            report.completed = self.leases.remaining_count().await? == 0;
        }

        info!(
            completed = report.completed,
            workers = report.workers.len(),
            "job finished"
        );
        Ok(report)
    }

    /// Unchunked run: one pass over the whole source, every output written
    /// as soon as it is produced. No lease table is involved.
    pub async fn run_direct(&self) -> Result<DirectSummary> {
        if self.options.reset_destination {
            info!("clearing destination");
            self.destination.clear().await?;
        }
        info!("running without chunking");

        let mut summary = DirectSummary::default();
        let mut context = match self
            .transform
            .init(self.source.as_ref(), self.destination.as_read())
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "init hook failed; nothing processed");
                return Ok(summary);
            }
        };

        let mut cursor = self.source.open_cursor(None, self.options.sort).await?;
        loop {
            let batch = cursor.next_batch().await?;
            if batch.is_empty() {
                break;
            }
            for record in &batch {
                let output = match self.transform.apply(&mut context, record) {
                    Ok(output) => output,
                    Err(e) => {
                        summary.failed += 1;
                        warn!(
                            key = record.key.as_ref().map(ToString::to_string).unwrap_or_default(),
                            error = %e,
                            "transform failed; record skipped"
                        );
                        continue;
                    }
                };
                summary.good += 1;
                let Some(output) = output else { continue };
                match self.destination.write_batch(std::slice::from_ref(&output)).await {
                    Ok(()) => summary.written += 1,
                    Err(e) => {
                        summary.write_failures += 1;
                        warn!(error = %e, "write failed; output dropped");
                    }
                }
            }
        }

        info!(
            good = summary.good,
            failed = summary.failed,
            written = summary.written,
            "direct run finished"
        );
        Ok(summary)
    }
}

/// Build a job and run it with `runner`.
pub async fn submit<T, R>(
    transform: T,
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    leases: LeaseTable,
    options: JobOptions,
    runner: &R,
) -> Result<JobReport>
where
    T: Transform + 'static,
    R: WorkerRunner,
{
    Job::new(transform, source, destination, leases, options)
        .run(runner)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_from_partial_toml() {
        let options: JobOptions = toml::from_str(
            r#"
            parallelism = 4
            mode = "process_only"
            write_failure = "fail_chunk"
            recheck_interval_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(options.parallelism, Some(4));
        assert_eq!(options.mode, JobMode::ProcessOnly);
        assert_eq!(options.write_failure, WriteFailurePolicy::FailChunk);
        assert_eq!(options.recheck_interval(), Some(Duration::from_secs(30)));
        assert_eq!(options.lease_timeout(), Duration::from_secs(120));
        assert!(options.wait_done);
    }
}
