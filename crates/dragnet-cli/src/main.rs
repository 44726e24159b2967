mod ingest;
mod processor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dragnet_core::clock::SystemClock;
use dragnet_core::config::{self, QueueConfig, WorkerConfig};
use dragnet_core::monitor::{Monitor, ProgressTracker};
use dragnet_core::rate_limit::{RateLimitPolicy, RateLimiter, RateLimiterConfig};
use dragnet_core::worker::{TracingWorkerReporter, WorkerService, WorkerSummary};
use dragnet_core::{TaskId, TaskManager, TaskState};
use dragnet_db::{Database, DatabaseConfig, PgTaskStore};

use crate::ingest::CsvOptions;
use crate::processor::CommandProcessor;

#[derive(Parser)]
#[command(name = "dragnet", version, about = "Distributed scraping task queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a CSV of businesses into the queue
    Enqueue {
        /// Input CSV file
        file: PathBuf,

        /// Column holding the business identifier
        #[arg(short, long, default_value = "id")]
        key_column: String,

        /// Field delimiter
        #[arg(short, long, default_value_t = ';')]
        delimiter: char,

        /// Rows per progress batch
        #[arg(long, env = "DRAGNET_BATCH_SIZE", default_value_t = config::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Retry ceiling for the new tasks
        #[arg(long, env = "DRAGNET_MAX_ATTEMPTS")]
        max_attempts: Option<u32>,

        /// Drop every existing task first
        #[arg(long, default_value_t = false)]
        reset: bool,
    },

    /// Run scraping workers until the queue drains
    Work {
        /// Program run once per task (task JSON on stdin, fields JSON on stdout)
        #[arg(short, long, env = "DRAGNET_COMMAND")]
        command: String,

        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,

        /// Concurrent workers in this process
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Stop each worker after this many tasks
        #[arg(long, env = "DRAGNET_MAX_TASKS")]
        max_tasks: Option<u64>,

        /// Stop after this many seconds without work
        #[arg(long, env = "DRAGNET_IDLE_TIMEOUT_SECS", default_value_t = 60)]
        idle_timeout: u64,

        /// Kill the program after this many seconds
        #[arg(long, env = "DRAGNET_TASK_TIMEOUT_SECS", default_value_t = 120)]
        task_timeout: u64,
    },

    /// Show queue counts, progress, and workers
    Status {
        /// Refresh every N seconds until interrupted
        #[arg(short, long)]
        watch: Option<u64>,

        /// Recent failures to list
        #[arg(long, default_value_t = 5)]
        failures: usize,
    },

    /// Return tasks with expired leases to the queue
    Reclaim,

    /// Put failed or dead tasks back in the queue
    Revive {
        /// A single task id
        #[arg(required_unless_present = "state")]
        id: Option<String>,

        /// Every task in this state (failed or dead)
        #[arg(long, conflicts_with = "id")]
        state: Option<TaskState>,
    },

    /// Show or change the shared rate limit
    RateLimit {
        /// New ceiling in attempts per minute
        #[arg(long)]
        per_minute: Option<u32>,
    },

    /// Delete every task in every state
    Reset {
        /// Confirm the reset
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dragnet=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enqueue {
            file,
            key_column,
            delimiter,
            batch_size,
            max_attempts,
            reset,
        } => {
            if !delimiter.is_ascii() {
                bail!("Delimiter must be a single ASCII character");
            }
            let options = CsvOptions {
                key_column,
                delimiter: delimiter as u8,
            };
            let db = connect_db().await?;
            cmd_enqueue(&db, &file, &options, batch_size, max_attempts, reset).await?;
        }
        Commands::Work {
            command,
            args,
            workers,
            max_tasks,
            idle_timeout,
            task_timeout,
        } => {
            let db = connect_db().await?;
            let processor =
                CommandProcessor::new(command, args, Duration::from_secs(task_timeout));
            let worker_config = WorkerConfig::default()
                .with_idle_timeout(Duration::from_secs(idle_timeout))
                .with_max_tasks(max_tasks);
            cmd_work(&db, processor, worker_config, workers).await?;
        }
        Commands::Status { watch, failures } => {
            let db = connect_db().await?;
            cmd_status(&db, watch, failures).await?;
        }
        Commands::Reclaim => {
            let db = connect_db().await?;
            let reclaimed = manager(&db)?.sweep().await?;
            for task in &reclaimed {
                println!(
                    "  {} -> {} (was held by {})",
                    task.id,
                    task.state,
                    task.previous_owner.as_deref().unwrap_or("unknown")
                );
            }
            println!("Reclaimed {} tasks", reclaimed.len());
        }
        Commands::Revive { id, state } => {
            let db = connect_db().await?;
            cmd_revive(&db, id, state).await?;
        }
        Commands::RateLimit { per_minute } => {
            let db = connect_db().await?;
            let limiter = rate_limiter(&db)?;
            if let Some(limit) = per_minute {
                limiter.set_policy(RateLimitPolicy::per_minute(limit)?).await?;
            }
            let policy = limiter.policy().await;
            println!(
                "Rate limit: {} attempts per {}s ({:.1}/min)",
                policy.limit,
                policy.window.as_secs_f64(),
                policy.per_minute_rate()
            );
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("Refusing to delete every task without --yes");
            }
            let db = connect_db().await?;
            let removed = manager(&db)?.purge().await?;
            println!("Deleted {removed} tasks");
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

fn manager(db: &Database) -> Result<TaskManager<PgTaskStore>> {
    Ok(TaskManager::new(db.task_store(), QueueConfig::from_env()?))
}

fn rate_limiter(db: &Database) -> Result<RateLimiter<PgTaskStore>> {
    let policy = config::rate_limit_from_env()?;
    Ok(RateLimiter::new(
        db.task_store(),
        Arc::new(SystemClock),
        RateLimiterConfig::new(policy),
    ))
}

/// Host part of worker ids. Without a hostname a random suffix keeps
/// machines apart.
fn host_label(hostname: Option<String>) -> String {
    match hostname.filter(|h| !h.trim().is_empty()) {
        Some(host) => host.trim().to_string(),
        None => format!("localhost-{}", &Uuid::new_v4().simple().to_string()[..8]),
    }
}

/// `<host>-<pid>-<n>`, unique across machines and processes.
fn worker_id(host: &str, index: usize) -> String {
    format!("{host}-{}-{index}", std::process::id())
}

async fn cmd_enqueue(
    db: &Database,
    file: &Path,
    options: &CsvOptions,
    batch_size: usize,
    max_attempts: Option<u32>,
    reset: bool,
) -> Result<()> {
    let mut queue_config = QueueConfig::from_env()?;
    if let Some(max) = max_attempts {
        queue_config = queue_config.with_max_attempts(max);
    }
    let tm = TaskManager::new(db.task_store(), queue_config);

    if reset {
        let removed = tm.purge().await?;
        println!("Reset: deleted {removed} existing tasks");
    }

    let entities = ingest::read_entities(file, options)?;
    tracing::info!(rows = entities.len(), file = %file.display(), "Loaded input");

    let summary = tm.enqueue_batch(entities, batch_size).await?;
    println!(
        "Enqueued {} of {} rows: {} new, {} revived, {} already queued, {} rejected",
        summary.enqueued(),
        summary.submitted,
        summary.created,
        summary.revived,
        summary.duplicates,
        summary.rejected
    );
    print_counts(&tm.counts().await?);
    Ok(())
}

async fn cmd_work(
    db: &Database,
    processor: CommandProcessor,
    worker_config: WorkerConfig,
    workers: usize,
) -> Result<()> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    let tm = manager(db)?;
    let limiter = rate_limiter(db)?;
    let cancel_token = CancellationToken::new();

    let shutdown = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, finishing in-flight tasks");
            shutdown.cancel();
        }
    });

    let sweeper_token = cancel_token.child_token();
    let sweeper = tm.spawn_sweeper(sweeper_token.clone());

    let host = host_label(
        std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok(),
    );
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let service = WorkerService::new(
            tm.clone(),
            limiter.clone(),
            processor.clone(),
            db.results_repo(),
            worker_config.clone().with_worker_id(worker_id(&host, index)),
        );
        let token = cancel_token.clone();
        handles.push(tokio::spawn(async move {
            service.run(token, &TracingWorkerReporter).await
        }));
    }

    let mut total = (0u64, 0u64, 0u64);
    for handle in handles {
        match handle.await {
            Ok(WorkerSummary {
                processed,
                succeeded,
                failed,
                ..
            }) => {
                total.0 += processed;
                total.1 += succeeded;
                total.2 += failed;
            }
            Err(e) => tracing::error!(error = %e, "Worker task panicked"),
        }
    }

    sweeper_token.cancel();
    let _ = sweeper.await;

    println!(
        "Processed {} tasks: {} succeeded, {} failed",
        total.0, total.1, total.2
    );
    Ok(())
}

async fn cmd_status(db: &Database, watch: Option<u64>, failures: usize) -> Result<()> {
    let monitor = Monitor::new(db.task_store()).with_stall_after(config::stall_after_from_env()?);
    let mut tracker = ProgressTracker::default();

    let Some(every) = watch else {
        return print_status(&monitor, &mut tracker, failures).await;
    };

    let mut timer = tokio::time::interval(Duration::from_secs(every.max(1)));
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        print_status(&monitor, &mut tracker, failures).await?;
        println!();
    }
    Ok(())
}

async fn print_status(
    monitor: &Monitor<PgTaskStore>,
    tracker: &mut ProgressTracker,
    failures: usize,
) -> Result<()> {
    let snapshot = monitor.snapshot().await?;
    let progress = tracker.record(&snapshot.counts, snapshot.taken_at);

    println!(
        "Queue status at {}:",
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    print_counts(&snapshot.counts);

    let rate = progress
        .throughput
        .map_or_else(|| "-".to_string(), |r| format!("{:.1}/min", r * 60.0));
    let eta = progress
        .eta
        .map_or_else(|| "-".to_string(), |d| format_duration(d));
    println!(
        "Progress: {:.1}% ({}/{}), rate {}, eta {}",
        progress.ratio * 100.0,
        progress.finished,
        snapshot.counts.total(),
        rate,
        eta
    );

    println!(
        "Workers: {} active, {} stalled",
        snapshot.active_workers(),
        snapshot.stalled_workers()
    );
    for worker in &snapshot.workers {
        let hb = &worker.heartbeat;
        println!(
            "  {:<32} {:<10} done={:<6} failed={:<6} seen {}{}",
            hb.worker_id,
            hb.state,
            hb.tasks_done,
            hb.tasks_failed,
            hb.last_seen.format("%H:%M:%S"),
            if worker.stalled { "  [STALLED]" } else { "" }
        );
    }

    if failures > 0 {
        let recent = monitor.recent_failures(failures).await?;
        if !recent.is_empty() {
            println!("Recent failures:");
            for f in recent {
                println!(
                    "  [{}] {} after {} attempts: {}",
                    f.state,
                    f.id,
                    f.attempts,
                    f.last_error.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

async fn cmd_revive(db: &Database, id: Option<String>, state: Option<TaskState>) -> Result<()> {
    let tm = manager(db)?;
    match (id, state) {
        (Some(id), _) => {
            let task_id = TaskId::new(&id)?;
            if tm.revive(&task_id).await? {
                println!("Revived {task_id}");
            } else {
                println!("{task_id} is not failed or dead; nothing to do");
            }
        }
        (None, Some(state)) => {
            if !state.is_revivable() {
                bail!("Only failed or dead tasks can be revived, got '{state}'");
            }
            let count = tm.revive_all(state).await?;
            println!("Revived {count} {state} tasks");
        }
        (None, None) => bail!("Pass a task id or --state"),
    }
    Ok(())
}

fn print_counts(counts: &dragnet_core::QueueCounts) {
    for state in TaskState::ALL {
        println!("  {:<8} {:>8}", state.as_str(), counts.get(state));
    }
    println!("  {:<8} {:>8}", "total", counts.total());
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
