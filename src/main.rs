use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wayfarer::config::Config;

mod commands;

use commands::{DeadLetterAction, EnqueueParams, Runtime, WorkerParams};

#[derive(Parser)]
#[command(
    name = "wayfarer",
    version,
    about = "Resilient travel-advisory ingestion with governed source access and dead-letter recovery",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and aggregate advisories right now
    Fetch {
        /// Country to fetch; all published advisories when omitted
        #[arg(short = 'C', long)]
        country: Option<String>,

        /// Sources to query (comma separated); all enabled sources when omitted
        #[arg(short, long, value_delimiter = ',')]
        sources: Vec<String>,

        /// Stop issuing new source calls after this many seconds
        #[arg(long)]
        deadline: Option<u64>,

        /// Print the result as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Schedule a job for the worker pool
    Enqueue {
        /// Source to refresh; fans out to every source when omitted
        #[arg(short, long)]
        source: Option<String>,

        /// Country to refresh
        #[arg(short = 'C', long)]
        country: Option<String>,

        /// Priority (low, normal, high, critical)
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// Run the worker pool
    Worker {
        /// Number of concurrent workers (defaults to jobs.workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Process everything queued, then exit
        #[arg(long, default_value = "false")]
        drain: bool,

        /// Seconds between polls for jobs enqueued elsewhere
        #[arg(long, default_value = "30")]
        poll_secs: u64,
    },

    /// Inspect and process the dead-letter queue
    DeadLetter {
        #[command(subcommand)]
        action: DeadLetterCommand,
    },

    /// Roll completed jobs up into health windows
    Rollup {
        /// Period length in hours
        #[arg(long, default_value = "1")]
        hours: i64,

        /// Print the windows as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Show per-source health and active alerts
    Health {
        /// Call every source's health endpoint first
        #[arg(long, default_value = "false")]
        check: bool,

        /// Print the snapshot as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Check sources and print Prometheus metrics
    Metrics,
}

#[derive(Subcommand)]
enum DeadLetterCommand {
    /// Requeue records below the attempt ceiling, flag the rest
    Process {
        /// Maximum records to examine
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Requeue a record regardless of the ceiling
    Requeue {
        /// Dead-letter record id
        id: String,
    },
    /// Close a record without running it again
    Resolve {
        /// Dead-letter record id
        id: String,
    },
    /// Show the dead-letter records of a job
    Show {
        /// Original job id
        job_id: String,
    },
}

impl From<DeadLetterCommand> for DeadLetterAction {
    fn from(command: DeadLetterCommand) -> Self {
        match command {
            DeadLetterCommand::Process { limit } => Self::Process { limit },
            DeadLetterCommand::Requeue { id } => Self::Requeue { id },
            DeadLetterCommand::Resolve { id } => Self::Resolve { id },
            DeadLetterCommand::Show { job_id } => Self::Show { job_id },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;

    // Initialize tracing/logging
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    tracing::info!(sources = config.sources.len(), "wayfarer starting");
    let runtime = Runtime::build(config).await?;

    match cli.command {
        Commands::Fetch {
            country,
            sources,
            deadline,
            json,
        } => {
            tracing::info!(
                country = ?country,
                sources = ?sources,
                deadline = ?deadline,
                "Starting fetch command"
            );
            commands::fetch(&runtime, country, sources, deadline, json).await?;
        }

        Commands::Enqueue {
            source,
            country,
            priority,
        } => {
            commands::enqueue(
                &runtime,
                EnqueueParams {
                    source,
                    country,
                    priority,
                },
            )?;
        }

        Commands::Worker {
            workers,
            drain,
            poll_secs,
        } => {
            tracing::info!(workers = ?workers, drain, "Starting worker command");
            commands::worker(
                &runtime,
                WorkerParams {
                    workers,
                    drain,
                    poll_secs,
                },
            )
            .await?;
        }

        Commands::DeadLetter { action } => {
            commands::dead_letter(&runtime, action.into()).await?;
        }

        Commands::Rollup { hours, json } => {
            commands::rollup(&runtime, hours, json)?;
        }

        Commands::Health { check, json } => {
            commands::health(&runtime, check, json).await?;
        }

        Commands::Metrics => {
            commands::metrics(&runtime).await?;
        }
    }

    tracing::info!("wayfarer completed successfully");
    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("wayfarer=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("wayfarer={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
