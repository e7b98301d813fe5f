use anyhow::Result;
use std::time::Duration;

use wayfarer::aggregator::AggregatedResult;

use super::Runtime;

/// Fetch advisories from every enabled source (or the named ones) and print them
pub async fn fetch(
    runtime: &Runtime,
    country: Option<String>,
    sources: Vec<String>,
    deadline_secs: Option<u64>,
    json: bool,
) -> Result<()> {
    let selected = (!sources.is_empty()).then_some(sources.as_slice());
    let deadline = deadline_secs
        .map(Duration::from_secs)
        .or(runtime.config.aggregator.deadline_secs.map(Duration::from_secs));

    let result = runtime
        .aggregator
        .fetch_with_deadline(country.as_deref(), selected, deadline)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(country.as_deref(), &result);
    }

    if !result.success {
        anyhow::bail!("No source returned advisories");
    }
    Ok(())
}

fn print_result(country: Option<&str>, result: &AggregatedResult) {
    println!("Travel Advisories: {}", country.unwrap_or("all countries"));
    println!("==================");

    for record in &result.records {
        println!(
            "[{:<10}] {:<24} {:<12} {}",
            record.risk_level.as_str(),
            record.country,
            record.source,
            record.summary
        );
    }

    println!("\nSources used: {}", result.sources_used.join(", "));
    if !result.per_source_errors.is_empty() {
        println!("\nSource Errors");
        println!("-------------");
        for (source, error) in &result.per_source_errors {
            println!("{source}: {error}");
        }
    }
}
