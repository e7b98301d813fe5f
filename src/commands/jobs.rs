use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use wayfarer::health::TracingNotifier;
use wayfarer::jobs::{DeadLetterManager, Scheduler, TaskRegistry, Worker};
use wayfarer::metrics;
use wayfarer::models::{Priority, TaskArgs};

use super::Runtime;

/// Arguments of the `enqueue` command
pub struct EnqueueParams {
    pub source: Option<String>,
    pub country: Option<String>,
    pub priority: String,
}

/// Arguments of the `worker` command
pub struct WorkerParams {
    pub workers: Option<usize>,
    pub drain: bool,
    pub poll_secs: u64,
}

/// Persist a new job; a running worker picks it up
pub fn enqueue(runtime: &Runtime, params: EnqueueParams) -> Result<()> {
    let priority = Priority::parse(&params.priority)
        .with_context(|| format!("Unknown priority '{}'", params.priority))?;
    let args = match (params.source, params.country) {
        (Some(source), Some(country)) => TaskArgs::FetchCountry { source, country },
        (Some(source), None) => TaskArgs::FetchSource { source },
        (None, country) => TaskArgs::FetchAll { country },
    };

    let scheduler = Scheduler::new(Arc::clone(&runtime.store), &runtime.config);
    let job_id = scheduler.enqueue(args, priority)?;
    println!("{job_id}");
    Ok(())
}

/// Run the worker pool together with dead-letter processing and retention
pub async fn worker(runtime: &Runtime, params: WorkerParams) -> Result<()> {
    metrics::init_metrics().map_err(|e| anyhow::anyhow!("Failed to init metrics: {e}"))?;

    let config = &runtime.config;
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&runtime.store), config));
    let registry = Arc::new(TaskRegistry::with_aggregator(Arc::clone(&runtime.aggregator)));
    let worker = Arc::new(Worker::new(Arc::clone(&scheduler), registry));
    let dead_letters = Arc::new(
        DeadLetterManager::new(Arc::clone(&scheduler), &config.dead_letter)
            .with_notifier(Arc::new(TracingNotifier), "operators"),
    );

    let report = worker.recover().await?;
    println!(
        "Recovered: {} pending, {} retries, {} orphaned, {} dead-lettered",
        report.pending, report.retries, report.orphaned, report.dead_lettered
    );

    if params.drain {
        let processed = worker.run_until_empty().await;
        let batch = dead_letters.process_next_batch().await?;
        println!("Processed {processed} queue entries");
        println!(
            "Dead letters: {} examined, {} requeued, {} need manual review",
            batch.examined, batch.requeued, batch.manual
        );
        let requeued = worker.run_until_empty().await;
        if requeued > 0 {
            println!("Processed {requeued} requeued jobs");
        }
        scheduler.archive_expired()?;
        return Ok(());
    }

    let dead_letter_loop = {
        let dead_letters = Arc::clone(&dead_letters);
        let interval = Duration::from_secs(config.dead_letter.interval_secs.max(1));
        tokio::spawn(async move { dead_letters.run(interval).await })
    };

    let housekeeping = {
        let worker = Arc::clone(&worker);
        let scheduler = Arc::clone(&scheduler);
        let poll = Duration::from_secs(params.poll_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            let mut last_archive = tokio::time::Instant::now();
            loop {
                ticker.tick().await;
                if scheduler.queue().is_closed() {
                    break;
                }
                if let Err(e) = worker.poll_pending() {
                    tracing::warn!(error = %e, "Failed to poll pending jobs");
                }
                if last_archive.elapsed() >= Duration::from_secs(3600) {
                    last_archive = tokio::time::Instant::now();
                    if let Err(e) = scheduler.archive_expired() {
                        tracing::warn!(error = %e, "Failed to archive completed jobs");
                    }
                }
            }
        })
    };

    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                scheduler.shutdown();
            }
        });
    }

    let workers = params.workers.unwrap_or(config.jobs.workers);
    tracing::info!(workers, "Worker pool starting");
    Arc::clone(&worker).run(workers).await;

    dead_letter_loop.abort();
    housekeeping.abort();
    tracing::info!("Worker pool stopped");
    Ok(())
}
