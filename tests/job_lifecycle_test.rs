//! End-to-end job lifecycle tests
//!
//! Jobs run through the worker against mock sources, so every retry and
//! dead-letter decision is driven by real HTTP failures.

mod common;

use std::sync::Arc;

use serde_json::json;
use wayfarer::jobs::{DeadLetterManager, Scheduler, TaskRegistry, Worker};
use wayfarer::models::{JobStatus, Priority, TaskArgs};
use wayfarer::storage::Persistence;
use wayfarer::utils::retry::RetryConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{advisory_json, aggregator, config_with, memory_store, source_config};

struct Harness {
    store: Arc<dyn Persistence>,
    scheduler: Arc<Scheduler>,
    worker: Worker,
    dead_letters: DeadLetterManager,
}

fn harness(server: &MockServer) -> Harness {
    // One HTTP attempt per job attempt keeps the call counts exact
    let config = config_with(&[("gov", source_config(&server.uri()))], 1);
    let store = memory_store();
    let registry = Arc::new(TaskRegistry::with_aggregator(aggregator(&config, &store)));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), &config));
    let worker = Worker::new(Arc::clone(&scheduler), registry)
        .with_backoff(RetryConfig::with_delays(u32::MAX, 1, 5).without_jitter());
    let dead_letters = DeadLetterManager::new(Arc::clone(&scheduler), &config.dead_letter);

    Harness {
        store,
        scheduler,
        worker,
        dead_letters,
    }
}

async fn mount_failing(server: &MockServer, status: u16) {
    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_job_succeeds_after_transient_failures() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([advisory_json("Peru", json!(2))])))
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server);
    let job_id = h.scheduler.enqueue_source("gov", Priority::High).unwrap();
    h.worker.run_until_empty().await;

    let job = h.store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.retry_count, 2);
    assert!(job.completed_at.is_some());
    assert!(job.duration_ms.is_some());
    assert!(h.store.dead_letters_for_job(job_id).unwrap().is_empty());
}

/// max_retries = 3 means three attempts, then DEAD_LETTER with no fourth call
#[tokio::test]
async fn test_exhausted_job_is_dead_lettered() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server);
    let job_id = h.scheduler.enqueue_source("gov", Priority::Normal).unwrap();
    h.worker.run_until_empty().await;

    let job = h.store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.retry_count, 3);

    let records = h.store.dead_letters_for_job(job_id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].total_retry_attempts, 3);
    assert_eq!(records[0].original_args, TaskArgs::FetchSource { source: "gov".to_string() });
    assert!(records[0].failure_reason.contains("retries exhausted"));
}

/// A missing advisory is permanent: one attempt, straight to the dead-letter queue
#[tokio::test]
async fn test_not_found_dead_letters_without_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories/Atlantis"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server);
    let job_id = h
        .scheduler
        .enqueue_country("gov", "Atlantis", Priority::Normal)
        .unwrap();
    h.worker.run_until_empty().await;

    let job = h.store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::DeadLetter);
    let records = h.store.dead_letters_for_job(job_id).unwrap();
    assert!(records[0].failure_reason.contains("permanent failure"));
}

/// Dead letters are requeued with their lineage until the ceiling, then flagged
#[tokio::test]
async fn test_dead_letter_requeue_then_manual_review() {
    let mock_server = MockServer::start().await;
    mount_failing(&mock_server, 500).await;

    let h = harness(&mock_server);
    let job_id = h.scheduler.enqueue_source("gov", Priority::High).unwrap();
    h.worker.run_until_empty().await;

    // 3 attempts < 5: requeue
    let report = h.dead_letters.process_next_batch().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.manual, 0);

    let first_record = h.store.dead_letters_for_job(job_id).unwrap().remove(0);
    assert!(first_record.processed);
    let requeued_id = first_record.requeued_job_id.expect("requeued job");
    let requeued = h.store.get_job(requeued_id).unwrap().unwrap();
    assert_eq!(requeued.requeued_from, Some(job_id));
    assert_eq!(requeued.previous_attempts, 3);
    assert_eq!(requeued.priority, Priority::High);

    // The requeued job fails three more times
    h.worker.run_until_empty().await;
    let requeued = h.store.get_job(requeued_id).unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::DeadLetter);

    // 6 attempts >= 5: manual review, nothing requeued
    let report = h.dead_letters.process_next_batch().await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.manual, 1);

    let second_record = h.store.dead_letters_for_job(requeued_id).unwrap().remove(0);
    assert_eq!(second_record.total_retry_attempts, 6);
    assert!(second_record.manual_intervention_required);
    assert!(!second_record.processed);

    // Flagged records are not examined again
    let report = h.dead_letters.process_next_batch().await.unwrap();
    assert_eq!(report.examined, 0);

    let requests = mock_server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 6);
}

/// An operator can force a flagged record back into the queue
#[tokio::test]
async fn test_force_requeue_after_source_recovers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([advisory_json("Chile", json!(1))])))
        .mount(&mock_server)
        .await;

    let h = harness(&mock_server);
    let job_id = h.scheduler.enqueue_source("gov", Priority::Normal).unwrap();
    h.worker.run_until_empty().await;

    let record = h.store.dead_letters_for_job(job_id).unwrap().remove(0);
    let new_job_id = h.dead_letters.force_requeue(record.id).unwrap();
    // Idempotent
    assert_eq!(h.dead_letters.force_requeue(record.id).unwrap(), new_job_id);

    h.worker.run_until_empty().await;
    let job = h.store.get_job(new_job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.requeued_from, Some(job_id));
}

/// A fan-out job succeeds when at least one source answers
#[tokio::test]
async fn test_fan_out_job_tolerates_partial_failure() {
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([advisory_json("Japan", json!(1))])))
        .mount(&healthy)
        .await;
    let broken = MockServer::start().await;
    mount_failing(&broken, 502).await;

    let config = config_with(
        &[
            ("healthy", source_config(&healthy.uri())),
            ("broken", source_config(&broken.uri())),
        ],
        1,
    );
    let store = memory_store();
    let registry = Arc::new(TaskRegistry::with_aggregator(aggregator(&config, &store)));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store), &config));
    let worker = Worker::new(Arc::clone(&scheduler), registry)
        .with_backoff(RetryConfig::with_delays(u32::MAX, 1, 5).without_jitter());

    let job_id = scheduler.enqueue_all(None, Priority::Normal).unwrap();
    worker.run_until_empty().await;

    let job = store.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.retry_count, 0);
}

/// Jobs for unknown sources are rejected at enqueue time
#[tokio::test]
async fn test_enqueue_unknown_source_rejected() {
    let mock_server = MockServer::start().await;
    let h = harness(&mock_server);

    assert!(h.scheduler.enqueue_source("nope", Priority::Normal).is_err());
    assert!(h.scheduler.queue().is_empty());
}
