//! chunkmap CLI: run, plan, supervise and inspect chunked copy jobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkmap::config::secrets::ExposeSecret;
use chunkmap::config::{Config, JobFile};
use chunkmap::db::{Db, PgDestination, PgLeaseStore, PgSource};
use chunkmap::engine::{InProcessRunner, ProcessRunner, WORKER_INDEX_ENV};
use chunkmap::job::{Job, JobMode, JobReport};
use chunkmap::lease::LeaseTable;
use chunkmap::model::{ChunkState, Key, OutputRecord, SourceRecord};
use chunkmap::telemetry::{TelemetryConfig, init_telemetry};
use chunkmap::transform::{FnTransform, TransformResult, transform_fn};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chunkmap", about = "Parallel chunked copy between Postgres tables")]
struct Cli {
    /// Job definition (TOML)
    #[arg(long, short, global = true, default_value = "job.toml")]
    job: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan, process and supervise the job
    Run {
        /// Override the job file's worker count
        #[arg(long)]
        parallelism: Option<usize>,
        /// Run workers as child processes instead of tasks
        #[arg(long)]
        processes: bool,
    },
    /// Build the work queue and exit
    Plan,
    /// Supervise an existing work queue until it is done
    Manage,
    /// Run one worker against an existing work queue
    Worker,
    /// Show queue progress and chunks in flight
    Status,
    /// Show the event log of one chunk
    Events {
        /// Chunk start key, as JSON (`42`, `"abc"`) or bare text
        start: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "chunkmap".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let mut file = JobFile::load(&cli.job)?;
    if let Command::Run {
        parallelism: Some(parallelism),
        ..
    } = cli.command
    {
        file.job.options.parallelism = Some(parallelism);
    }
    let env = JobEnv::connect(&config, &file).await?;

    match cli.command {
        Command::Run { processes, .. } => cmd_run(&cli.job, file, env, processes).await,
        Command::Plan => {
            let job = env.job(file, |options| options.mode = JobMode::InitOnly);
            let report = job.run(&InProcessRunner).await?;
            print_report(&report);
            Ok(())
        }
        Command::Manage => {
            let job = env.job(file, |options| options.mode = JobMode::ManageOnly);
            let supervisor = job.supervisor();
            let stopper = supervisor.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                stopper.shutdown();
            });
            if supervisor.run().await? {
                println!("All chunks done.");
            } else {
                println!("Stopped before completion.");
            }
            Ok(())
        }
        Command::Worker => {
            let index = std::env::var(WORKER_INDEX_ENV).unwrap_or_else(|_| "-".to_string());
            let job = env.job(file, |_| {});
            let summary = job.worker_factory().worker().run().await?;
            println!(
                "worker {index} ({}): {} chunk(s) done, {} abandoned, {} good record(s)",
                summary.worker, summary.chunks_done, summary.chunks_abandoned, summary.records_good
            );
            Ok(())
        }
        Command::Status => cmd_status(&env.leases).await,
        Command::Events { start } => cmd_events(&env.leases, &start).await,
    }
}

/// Everything a job needs, wired to Postgres.
struct JobEnv {
    source: Arc<PgSource>,
    destination: Arc<PgDestination>,
    leases: LeaseTable,
}

impl JobEnv {
    async fn connect(config: &Config, file: &JobFile) -> anyhow::Result<Self> {
        let connections = Db::connections_for(file.job.options.parallelism.unwrap_or(0));
        let db = Db::connect_with(config.database_url.expose_secret(), connections).await?;
        db.migrate().await?;

        let source_db = match config.source_database_url {
            Some(ref url) => Db::connect_with(url.expose_secret(), connections).await?,
            None => db.clone(),
        };
        let mut source = PgSource::new(&source_db, &file.source.table, &file.source.partition_key)?;
        if let Some(ref filter) = file.source.filter {
            source = source.with_filter(filter.clone());
        }

        let destination = PgDestination::new(&db, &file.destination.table)?;
        destination.ensure_table().await?;

        let leases = LeaseTable::new(Arc::new(PgLeaseStore::new(&db, file.job.name.clone())));
        Ok(Self {
            source: Arc::new(source),
            destination: Arc::new(destination),
            leases,
        })
    }

    fn job(
        &self,
        file: JobFile,
        adjust: impl FnOnce(&mut chunkmap::job::JobOptions),
    ) -> Job<CopyTransform> {
        let mut options = file.job.options;
        adjust(&mut options);
        Job::new(
            transform_fn(copy_record as CopyFn),
            self.source.clone(),
            self.destination.clone(),
            self.leases.clone(),
            options,
        )
    }
}

type CopyFn = fn(&SourceRecord) -> TransformResult;
type CopyTransform = FnTransform<CopyFn>;

/// Copy the row as-is, identified by its partition key when it has one.
fn copy_record(record: &SourceRecord) -> TransformResult {
    Ok(Some(match record.key {
        Some(ref key) => OutputRecord::keyed(key.clone(), record.document.clone()),
        None => OutputRecord::unkeyed(record.document.clone()),
    }))
}

async fn cmd_run(
    job_path: &Path,
    file: JobFile,
    env: JobEnv,
    processes: bool,
) -> anyhow::Result<()> {
    let job = env.job(file, |_| {});

    let report = if processes {
        let program = std::env::current_exe()?;
        let args = vec![
            "--job".to_string(),
            job_path.display().to_string(),
            "worker".to_string(),
        ];
        job.run(&ProcessRunner::new(program, args)).await?
    } else {
        job.run(&InProcessRunner).await?
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &JobReport) {
    if let Some(ref plan) = report.plan {
        println!(
            "Planned {} chunk(s) of up to {} record(s), {} record(s) total.",
            plan.chunks, plan.chunk_size, plan.records
        );
    }
    if let Some(ref direct) = report.direct {
        println!(
            "Direct run: {} good, {} failed, {} written, {} write failure(s).",
            direct.good, direct.failed, direct.written, direct.write_failures
        );
    }
    for summary in &report.workers {
        println!(
            "  {}: {} done, {} abandoned, {} good",
            summary.worker, summary.chunks_done, summary.chunks_abandoned, summary.records_good
        );
    }
    if report.plan.is_none() && report.direct.is_none() && report.workers.is_empty() {
        println!("Nothing to report.");
    } else if report.completed {
        println!("Job complete.");
    }
}

async fn cmd_status(leases: &LeaseTable) -> anyhow::Result<()> {
    let stats = leases.stats().await?;
    let progress = chunkmap::lease::Progress::from_stats(&stats);

    println!(
        "{} chunk(s): {} open, {} working, {} done ({:.1}%)",
        stats.chunks,
        stats.open,
        stats.working,
        stats.done,
        progress.percent()
    );
    println!("{} record(s) planned, {} good so far", stats.records, stats.good);
    println!("{progress}");

    let working = leases.chunks(Some(ChunkState::Working)).await?;
    if working.is_empty() {
        return Ok(());
    }

    let now = leases.now();
    println!();
    println!("{:<20}  {:<20}  {:<40}  HELD", "START", "END", "OWNER");
    println!("{}", "-".repeat(92));
    for chunk in &working {
        let held = chunk
            .claimed_at
            .map(|t| format!("{}s", (now - t).num_seconds()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20}  {:<20}  {:<40}  {}",
            chunk.start.to_string(),
            chunk.end.to_string(),
            chunk.owner.as_ref().map(|o| o.0.as_str()).unwrap_or("-"),
            held
        );
    }
    Ok(())
}

async fn cmd_events(leases: &LeaseTable, start: &str) -> anyhow::Result<()> {
    let key = match serde_json::from_str::<serde_json::Value>(start) {
        Ok(value) => Key::from_json(&value)?,
        Err(_) => Some(Key::Text(start.to_string())),
    };
    let Some(key) = key else {
        anyhow::bail!("chunk start key cannot be null");
    };

    let Some(chunk) = leases.get(&key).await? else {
        anyhow::bail!("no chunk starts at {key}");
    };
    println!(
        "Chunk {}..={} ({}, {} of {} good)",
        chunk.start, chunk.end, chunk.state, chunk.good, chunk.total
    );

    let events = leases.events(&key).await?;
    if events.is_empty() {
        println!("No events recorded.");
        return Ok(());
    }
    for event in &events {
        println!(
            "{}  {:<16}  {:<30}  {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind.name(),
            event.worker.as_ref().map(|w| w.0.as_str()).unwrap_or("supervisor"),
            serde_json::to_string(&event.kind)?
        );
    }
    Ok(())
}
