//! courier CLI — operator interface to the task queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use courier::config::Config;
use courier::model::{NewTask, TaskId, TaskStatus};
use courier::processor::HookProcessor;
use courier::reporter::LogReporter;
use courier::scheduler::Scheduler;
use courier::store::TaskStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courier", about = "Durable, retried, rate-limited task processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon
    Serve {
        /// Executable invoked per task (receives task.json, writes result.json)
        #[arg(long)]
        hook: PathBuf,
        /// Base directory for per-task scratch dirs
        #[arg(long, default_value = "/tmp/courier-tasks")]
        work_dir: PathBuf,
    },
    /// Task operations against the shared store
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Enqueue a task
    Add {
        /// JSON prompt payload
        prompt: String,
        /// Reporter email (producer identity)
        reporter: String,
        /// Override the default retry budget
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// List tasks
    List {
        /// Filter by status (pending|processing|completed|failed)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one task in full, logs included
    Show {
        /// Task ID (full UUID)
        id: String,
    },
    /// Counts per status
    Stats,
    /// Remove terminal tasks older than the given age
    Cleanup {
        /// Age threshold in seconds (0 removes all terminal tasks)
        #[arg(long, default_value_t = 86_400)]
        max_age_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let cli = Cli::parse();
    let store = TaskStore::new(config.queue_file.clone(), config.max_retries);
    store.initialize()?;

    match cli.command {
        Command::Serve { hook, work_dir } => cmd_serve(config, store, hook, work_dir).await,
        Command::Task { action } => cmd_task(store, action),
    }
}

async fn cmd_serve(
    config: Config,
    store: TaskStore,
    hook: PathBuf,
    work_dir: PathBuf,
) -> anyhow::Result<()> {
    let processor = Arc::new(HookProcessor::new(hook, work_dir));
    let scheduler = Scheduler::new(
        store,
        processor,
        Arc::new(LogReporter),
        config.scheduler_config(),
    );

    scheduler.start().await?;
    info!("courier serving; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    scheduler.stop().await;
    Ok(())
}

fn cmd_task(store: TaskStore, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Add {
            prompt,
            reporter,
            max_retries,
        } => {
            let prompt: serde_json::Value = serde_json::from_str(&prompt)?;
            let mut new = NewTask::new(prompt, reporter);
            if let Some(n) = max_retries {
                new = new.max_retries(n);
            }
            let task = store.add_task(new)?;
            println!("added {} ({})", task.id.0, task.status);
        }
        TaskAction::List { status } => {
            let tasks = match status {
                Some(raw) => {
                    let status: TaskStatus = raw
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))?;
                    store.get_tasks_by_status(status)?
                }
                None => store.get_all_tasks()?,
            };
            for task in tasks {
                println!(
                    "{}  {:<10}  retries {}/{}  {}",
                    task.id.0, task.status, task.retries, task.max_retries, task.reporter_email
                );
            }
        }
        TaskAction::Show { id } => {
            let id: TaskId = id.parse()?;
            match store.get_task(id)? {
                Some(task) => {
                    println!("{}", serde_json::to_string_pretty(&task)?);
                    for log in &task.logs {
                        println!("{}  [{}]  {}", log.timestamp.to_rfc3339(), log.level, log.message);
                    }
                }
                None => println!("task not found"),
            }
        }
        TaskAction::Stats => {
            let stats = store.get_stats()?;
            println!(
                "pending {}  processing {}  completed {}  failed {}  (total {})",
                stats.pending,
                stats.processing,
                stats.completed,
                stats.failed,
                stats.total()
            );
        }
        TaskAction::Cleanup { max_age_secs } => {
            let removed = store.cleanup(Duration::from_secs(max_age_secs))?;
            println!("removed {removed} terminal tasks");
        }
    }
    Ok(())
}
