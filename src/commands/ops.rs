use anyhow::{Context, Result};
use std::sync::Arc;

use uuid::Uuid;
use wayfarer::health::{HealthMonitor, TracingNotifier};
use wayfarer::jobs::{DeadLetterManager, Scheduler};
use wayfarer::metrics::{encode_metrics, init_metrics, MetricsAggregator};

use super::Runtime;

/// Operator actions on the dead-letter queue
pub enum DeadLetterAction {
    /// Run one requeue/manual-review batch
    Process { limit: Option<usize> },
    /// Requeue a record regardless of the attempt ceiling
    Requeue { id: String },
    /// Close a record without running it again
    Resolve { id: String },
    /// Show the dead-letter records of a job
    Show { job_id: String },
}

pub async fn dead_letter(runtime: &Runtime, action: DeadLetterAction) -> Result<()> {
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&runtime.store), &runtime.config));
    let manager = DeadLetterManager::new(Arc::clone(&scheduler), &runtime.config.dead_letter)
        .with_notifier(Arc::new(TracingNotifier), "operators");

    match action {
        DeadLetterAction::Process { limit } => {
            let limit = limit.unwrap_or(runtime.config.dead_letter.batch_size);
            let report = manager.process_batch(limit).await?;
            println!("Dead-Letter Batch");
            println!("=================");
            println!("Examined: {}", report.examined);
            println!("Requeued: {}", report.requeued);
            println!("Manual review: {}", report.manual);
            if report.skipped > 0 {
                println!("Handled elsewhere: {}", report.skipped);
            }
        }
        DeadLetterAction::Requeue { id } => {
            let job_id = manager.force_requeue(parse_id(&id)?)?;
            println!("Requeued as job {job_id}");
        }
        DeadLetterAction::Resolve { id } => {
            let record = manager.resolve(parse_id(&id)?)?;
            println!("Resolved dead-letter record {}", record.id);
        }
        DeadLetterAction::Show { job_id } => {
            let records = runtime.store.dead_letters_for_job(parse_id(&job_id)?)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }
    Ok(())
}

/// Roll up jobs completed in the last `hours` hours
pub fn rollup(runtime: &Runtime, hours: i64, json: bool) -> Result<()> {
    let aggregator = MetricsAggregator::new(Arc::clone(&runtime.store));
    let windows = aggregator.rollup_last(chrono::Duration::hours(hours.max(1)))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&windows)?);
        return Ok(());
    }

    println!("Job Rollup (last {hours}h)");
    println!("==================");
    if windows.is_empty() {
        println!("No completed jobs in period");
    }
    for window in &windows {
        println!(
            "{:<12} {:<10} total={} ok={} failed={} retried={} dead={} success={:.1}% p95={}",
            window.source,
            window.health.as_str(),
            window.total_jobs,
            window.successful_jobs,
            window.failed_jobs,
            window.retried_jobs,
            window.dead_letter_jobs,
            window.success_rate * 100.0,
            window
                .p95_duration_ms
                .map(|ms| format!("{ms:.0}ms"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

/// Optionally check every source, then print the health snapshot
pub async fn health(runtime: &Runtime, check: bool, json: bool) -> Result<()> {
    if check {
        for (name, source) in runtime.sources() {
            let up = source.adapter.health_check().await;
            tracing::info!(source = %name, up, "Health check");
        }
    }

    let monitor = HealthMonitor::new(runtime.sources().clone(), Arc::new(TracingNotifier))
        .with_rollups(MetricsAggregator::new(Arc::clone(&runtime.store)));
    let snapshot = monitor.snapshot();
    monitor.dispatch_alerts(&snapshot).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("Source Health ({})", snapshot.overall().as_str());
    println!("=============");
    println!("Cache backend: {}", runtime.cache.backend());
    for (name, health) in &snapshot.per_source {
        println!(
            "{:<12} {:<10} circuit={} requests={} errors={:.1}% cache_hits={:.1}% avg={:.0}ms",
            name,
            health.status.as_str(),
            health
                .circuit_state
                .map(|s| s.as_str())
                .unwrap_or("-"),
            health.total_requests,
            health.error_rate * 100.0,
            health.cache_hit_rate * 100.0,
            health.avg_response_ms,
        );
    }
    if !snapshot.active_alerts.is_empty() {
        println!("\nActive Alerts");
        println!("-------------");
        for alert in &snapshot.active_alerts {
            println!("[{}] {}: {}", alert.severity, alert.title, alert.message);
        }
    }
    Ok(())
}

/// Check every source and print the Prometheus exposition
pub async fn metrics(runtime: &Runtime) -> Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to init metrics: {e}"))?;
    for source in runtime.sources().values() {
        source.adapter.health_check().await;
    }
    let text = encode_metrics().map_err(|e| anyhow::anyhow!("{e}"))?;
    print!("{text}");
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid id '{raw}'"))
}
