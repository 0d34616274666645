//! spool - command line front end for the spool task queue.
//!
//! Enqueue tasks into a SQLite file, run workers over it, inspect counts, and
//! trigger a recovery sweep by hand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use spool_core::domain::{ExecutionContext, TaskError};
use spool_core::impls::SqliteTaskStore;
use spool_core::typed::{Handler, TaskPayload};
use spool_core::{AppBuilder, QueueConfig, Runtime};

/// spool CLI.
#[derive(Parser)]
#[command(name = "spool")]
#[command(about = "Durable background-task queue")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the config)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Persist a new pending task and print its id
    Enqueue {
        /// Task type tag
        #[arg(long = "type")]
        task_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Run workers and the reaper until Ctrl-C
    Run {
        /// Number of worker slots (overrides the config)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Run one recovery sweep and print the summary
    Recover {
        /// Only reclaim tasks idle for longer than this (default: stuck_task_age_secs)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Print task counts per status as JSON
    Status,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoTask {
    message: String,
}

impl TaskPayload for EchoTask {
    const TYPE: &'static str = "echo";
}

struct EchoHandler;

#[async_trait]
impl Handler<EchoTask> for EchoHandler {
    async fn handle(&self, task: &EchoTask, ctx: &ExecutionContext) -> Result<(), TaskError> {
        info!(task_id = %ctx.task_id(), attempt = ctx.attempt(), "echo: {}", task.message);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FailTask {
    #[serde(default = "default_fail_reason")]
    reason: String,
}

fn default_fail_reason() -> String {
    "intentional failure".to_string()
}

impl TaskPayload for FailTask {
    const TYPE: &'static str = "fail";
}

struct FailHandler;

#[async_trait]
impl Handler<FailTask> for FailHandler {
    async fn handle(&self, task: &FailTask, _ctx: &ExecutionContext) -> Result<(), TaskError> {
        Err(TaskError::failed(task.reason.clone()))
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<QueueConfig> {
    let mut config = match &cli.config {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => QueueConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    Ok(config)
}

async fn build_runtime(config: QueueConfig) -> Result<Runtime> {
    let store = SqliteTaskStore::open(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))?;

    let runtime = AppBuilder::new()
        .with_store(Arc::new(store))
        .with_config(config)
        .register::<EchoTask, _>(EchoHandler)?
        .register::<FailTask, _>(FailHandler)?
        .expect_tasks(&[EchoTask::TYPE, FailTask::TYPE])
        .build()?;
    Ok(runtime)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Enqueue { task_type, payload } => {
            let value: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            let runtime = build_runtime(config).await?;
            let id = runtime
                .enqueue_raw(&task_type, serde_json::to_vec(&value)?)
                .await?;
            println!("{id}");
        }
        Commands::Run { workers } => {
            if let Some(workers) = workers {
                config.worker_count = workers;
            }
            let runtime = build_runtime(config).await?;
            let handle = runtime.start().await?;

            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("shutdown requested");
            handle.shutdown_and_join().await;
        }
        Commands::Recover { older_than_secs } => {
            let runtime = build_runtime(config).await?;
            let reaper = runtime.reaper();
            let summary = match older_than_secs {
                Some(secs) => reaper.sweep(Duration::from_secs(secs)).await?,
                None => reaper.scan().await?,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Status => {
            let runtime = build_runtime(config).await?;
            let counts = runtime.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
    }

    Ok(())
}
