use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use jobqueue::config::{ENV_DATA_DIR, QueueConfig, WorkerConfig};
use jobqueue::{JobQueue, JobState, NewJob};

/// jobqueue - persistent background job queue
#[derive(Parser, Debug)]
#[command(name = "jobqueue", version)]
#[command(about = "Persistent background job queue with retries and a dead letter queue", long_about = None)]
struct Cli {
    /// Data directory holding the database, PID file, and logs
    #[arg(long, global = true, env = ENV_DATA_DIR)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a job. Accepts a shell command, or a JSON object
    /// like '{"id":"job1","command":"sleep 2"}'
    Enqueue {
        job: String,

        /// Job id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Retry budget (defaults to the configured max_retries)
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Job counts per state and running workers
    Status,

    /// List jobs, newest first
    List {
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Dead letter queue
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Worker processes
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Effective configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum DlqCommand {
    /// List dead jobs
    List,
    /// Move a dead job back to pending
    Retry { id: String },
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
    /// Launch background worker processes (replaces running ones)
    Start {
        #[arg(long)]
        count: Option<usize>,
    },
    /// Stop all recorded worker processes
    Stop,
    /// Run a worker loop in the foreground (used by `worker start`)
    Run {
        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QueueConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }

    match cli.command {
        Commands::Worker(WorkerCommand::Run { id }) => run_worker(config, id).await,
        command => {
            init_cli_tracing();
            run_command(config, command).await
        }
    }
}

fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_command(config: QueueConfig, command: Commands) -> anyhow::Result<()> {
    let queue = JobQueue::open(config)
        .await
        .context("Failed to open job queue")?;

    match command {
        Commands::Enqueue {
            job,
            id,
            max_retries,
        } => {
            let mut submission = parse_submission(&job)?;
            if id.is_some() {
                submission.id = id;
            }
            if max_retries.is_some() {
                submission.max_retries = max_retries;
            }
            let job = queue.enqueue(submission).await?;
            print_json(&job)
        }

        Commands::Status => {
            let stats = queue.stats().await?;
            print_json(&serde_json::json!({
                "jobs": {
                    "pending": stats.pending,
                    "processing": stats.processing,
                    "completed": stats.completed,
                    "failed": stats.failed,
                    "dead": stats.dead,
                    "total": stats.total(),
                },
                "workers": {
                    "running": queue.active_worker_count(),
                    "holding_leases": stats.active_workers,
                },
            }))
        }

        Commands::List { state } => print_json(&queue.list_jobs(state).await?),

        Commands::Dlq(DlqCommand::List) => print_json(&queue.dlq_jobs().await?),

        Commands::Dlq(DlqCommand::Retry { id }) => print_json(&queue.retry_from_dlq(&id).await?),

        Commands::Worker(WorkerCommand::Start { count }) => {
            let count = count.unwrap_or(queue.config().worker_count);
            let pids = queue.start_workers(count).await?;
            print_json(&serde_json::json!({ "started": pids.len(), "pids": pids }))
        }

        Commands::Worker(WorkerCommand::Stop) => print_json(&queue.stop_workers().await),

        Commands::Worker(WorkerCommand::Run { .. }) => {
            anyhow::bail!("worker run is handled before the queue is opened")
        }

        Commands::Config(ConfigCommand::Show) => {
            let config = queue.config();
            print_json(&serde_json::json!({
                "max_retries": config.max_retries,
                "backoff_base": config.backoff_base,
                "worker_count": config.worker_count,
                "data_dir": config.data_dir,
                "db_path": config.db_path(),
                "pid_file": config.pid_file(),
                "log_dir": config.log_dir(),
            }))
        }
    }
}

/// A JSON job object, or a bare command.
fn parse_submission(raw: &str) -> anyhow::Result<NewJob> {
    if raw.trim_start().starts_with('{') {
        serde_json::from_str(raw).context("Invalid job JSON")
    } else {
        Ok(NewJob::new(raw))
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Foreground worker loop. Logs go to `<data_dir>/logs/<id>.log`.
async fn run_worker(config: QueueConfig, id: String) -> anyhow::Result<()> {
    config.ensure_dirs()?;

    let file_appender = tracing_appender::rolling::never(config.log_dir(), format!("{id}.log"));
    let (writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();

    let queue = JobQueue::open(config)
        .await
        .context("Failed to open job queue")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!(worker_id = %id, pid = std::process::id(), "Worker process starting");
    let worker = queue.worker(id, WorkerConfig::default(), shutdown_rx);
    worker.run().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing current job"),
        _ = terminate => info!("Received terminate signal, finishing current job"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command_submission() {
        let job = parse_submission("echo hello").unwrap();
        assert_eq!(job.command, "echo hello");
        assert_eq!(job.id, None);
    }

    #[test]
    fn json_submission() {
        let job = parse_submission(r#"{"id":"job1","command":"sleep 2","max_retries":5}"#).unwrap();
        assert_eq!(job.id.as_deref(), Some("job1"));
        assert_eq!(job.command, "sleep 2");
        assert_eq!(job.max_retries, Some(5));
        assert!(parse_submission("{not json").is_err());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["jobqueue", "list", "--state", "dead"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                state: Some(JobState::Dead)
            }
        ));

        let cli = Cli::try_parse_from(["jobqueue", "worker", "run", "--id", "worker-1-1"]).unwrap();
        assert!(matches!(cli.command, Commands::Worker(WorkerCommand::Run { ref id }) if id == "worker-1-1"));

        assert!(Cli::try_parse_from(["jobqueue", "list", "--state", "bogus"]).is_err());
    }
}
