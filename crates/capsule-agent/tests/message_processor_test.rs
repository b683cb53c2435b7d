// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for job admission, dispatch, retries and shutdown of the message processor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use capsule_agent::events::EventPayload;
use capsule_agent::message_processor::{MessageProcessor, ProcessorConfig, ProcessorError};
use capsule_core::persistence::MessageStore;
use capsule_core::{Job, JobStatus};
use serde_json::json;

use common::{
    FlakyWorker, PanickingWorker, RecordingWorker, SlowWorker, eventually, fast_config,
    next_event, processor, wait_for_event,
};

const WAIT: Duration = Duration::from_secs(5);

fn is_completion(payload: &EventPayload) -> bool {
    matches!(payload, EventPayload::JobCompleted { .. })
}

#[tokio::test]
async fn test_always_failing_job_exhausts_retries() {
    let (processor, _store, bus) = processor(fast_config());
    let worker = Arc::new(FlakyWorker::always_failing());
    processor.register_worker("flaky", worker.clone()).unwrap();
    let mut sub = bus.subscribe().unwrap();
    processor.start().await.unwrap();

    let id = processor
        .enqueue(Job::new("flaky", json!({})).with_max_retries(2))
        .await
        .unwrap();

    let event = wait_for_event(&mut sub, WAIT, is_completion).await.unwrap();
    match &event.payload {
        EventPayload::JobCompleted {
            job_id,
            status,
            retry_count,
            error,
            ..
        } => {
            assert_eq!(job_id, &id);
            assert_eq!(*status, JobStatus::Failed);
            assert_eq!(*retry_count, 2);
            assert_eq!(error.as_deref(), Some("attempt 3 failed"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(worker.attempts(), 3);

    let job = processor.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);

    // Exactly one completion per job
    assert!(next_event(&mut sub, Duration::from_millis(100)).await.is_none());
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_retryable_failures_then_success() {
    let (processor, _store, bus) = processor(fast_config());
    let worker = Arc::new(FlakyWorker::failing(2));
    processor.register_worker("flaky", worker.clone()).unwrap();
    let mut sub = bus.subscribe().unwrap();
    processor.start().await.unwrap();

    let id = processor.submit("flaky", json!({"n": 1})).await.unwrap();

    let event = wait_for_event(&mut sub, WAIT, is_completion).await.unwrap();
    assert!(matches!(
        &event.payload,
        EventPayload::JobCompleted { status: JobStatus::Done, retry_count: 2, error: None, .. }
    ));
    let job = processor.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.last_error.is_none());
    assert_eq!(worker.attempts(), 3);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let (processor, _store, bus) = processor(fast_config());
    let worker = Arc::new(FlakyWorker::permanent());
    processor.register_worker("strict", worker.clone()).unwrap();
    let mut sub = bus.subscribe().unwrap();
    processor.start().await.unwrap();

    let id = processor.submit("strict", json!({})).await.unwrap();
    wait_for_event(&mut sub, WAIT, is_completion).await.unwrap();

    let job = processor.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.last_error.as_deref(), Some("bad input"));
    assert_eq!(worker.attempts(), 1);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_queue_rejects_immediately() {
    let (processor, _store, _bus) = processor(ProcessorConfig {
        queue_capacity: 2,
        ..fast_config()
    });
    processor
        .register_worker("record", Arc::new(RecordingWorker::default()))
        .unwrap();

    processor.submit("record", json!({})).await.unwrap();
    processor.submit("record", json!({})).await.unwrap();

    let rejected = tokio::time::timeout(
        Duration::from_millis(100),
        processor.submit("record", json!({})),
    )
    .await
    .expect("enqueue must not wait for space");
    assert!(matches!(
        rejected,
        Err(ProcessorError::QueueFull { capacity: 2 })
    ));
    assert_eq!(processor.stats().pending, 2);
}

#[tokio::test]
async fn test_jobs_dispatch_in_fifo_order() {
    let (processor, _store, _bus) = processor(ProcessorConfig {
        workers: 1,
        ..fast_config()
    });
    let worker = Arc::new(RecordingWorker::default());
    processor.register_worker("record", worker.clone()).unwrap();

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(processor.submit("record", json!({ "n": n })).await.unwrap());
    }
    processor.start().await.unwrap();

    assert!(eventually(WAIT, || worker.seen().len() == 5).await);
    assert_eq!(worker.seen(), ids);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_registration_and_admission_rules() {
    let (processor, _store, _bus) = processor(fast_config());
    processor
        .register_worker("record", Arc::new(RecordingWorker::default()))
        .unwrap();
    assert!(matches!(
        processor.register_worker("record", Arc::new(RecordingWorker::default())),
        Err(ProcessorError::AlreadyRegistered(_))
    ));

    processor.start().await.unwrap();
    assert!(matches!(
        processor.start().await,
        Err(ProcessorError::AlreadyStarted)
    ));
    assert!(matches!(
        processor.register_worker("late", Arc::new(RecordingWorker::default())),
        Err(ProcessorError::AlreadyStarted)
    ));
    assert!(matches!(
        processor.submit("nobody-handles-this", json!({})).await,
        Err(ProcessorError::UnknownJobType(_))
    ));
    assert_eq!(processor.stats().job_types, vec!["record".to_string()]);

    processor.stop().await.unwrap();
    assert!(!processor.stats().running);
    assert!(matches!(
        processor.submit("record", json!({})).await,
        Err(ProcessorError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_panicking_worker_does_not_take_down_dispatchers() {
    let (processor, _store, bus) = processor(ProcessorConfig {
        workers: 1,
        ..fast_config()
    });
    let recorder = Arc::new(RecordingWorker::default());
    processor
        .register_worker("boom", Arc::new(PanickingWorker))
        .unwrap();
    processor.register_worker("ok", recorder.clone()).unwrap();
    let mut sub = bus.subscribe().unwrap();
    processor.start().await.unwrap();

    let boom = processor
        .enqueue(Job::new("boom", json!({})).with_max_retries(0))
        .await
        .unwrap();
    let ok = processor.submit("ok", json!({})).await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let event = wait_for_event(&mut sub, WAIT, is_completion).await.unwrap();
        if let EventPayload::JobCompleted {
            job_id,
            status,
            error,
            ..
        } = &event.payload
        {
            outcomes.push((job_id.clone(), *status, error.clone()));
        }
    }

    let (_, boom_status, boom_error) = outcomes.iter().find(|(id, _, _)| id == &boom).unwrap();
    assert_eq!(*boom_status, JobStatus::Failed);
    assert!(boom_error.as_deref().unwrap().contains("worker exploded"));
    let (_, ok_status, _) = outcomes.iter().find(|(id, _, _)| id == &ok).unwrap();
    assert_eq!(*ok_status, JobStatus::Done);
    assert_eq!(recorder.seen(), vec![ok]);
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_attempt_timeout_is_a_failure() {
    let (processor, _store, bus) = processor(ProcessorConfig {
        job_timeout: Duration::from_millis(50),
        ..fast_config()
    });
    processor
        .register_worker(
            "slow",
            Arc::new(SlowWorker {
                delay: Duration::from_secs(10),
            }),
        )
        .unwrap();
    let mut sub = bus.subscribe().unwrap();
    processor.start().await.unwrap();

    let id = processor
        .enqueue(Job::new("slow", json!({})).with_max_retries(0))
        .await
        .unwrap();
    wait_for_event(&mut sub, WAIT, is_completion).await.unwrap();

    let job = processor.job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("timed out"));
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_leaves_pending_jobs_for_next_start() {
    let (first, store, _bus) = processor(ProcessorConfig {
        workers: 1,
        ..fast_config()
    });
    let worker = Arc::new(RecordingWorker::with_delay(Duration::from_millis(100)));
    first.register_worker("record", worker.clone()).unwrap();
    first.start().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..3 {
        ids.push(first.submit("record", json!({ "n": n })).await.unwrap());
    }
    assert!(eventually(WAIT, || first.stats().in_flight == 1).await);
    first.stop().await.unwrap();

    assert_eq!(worker.seen(), vec![ids[0].clone()]);
    let pending = store.load_pending().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|j| j.status == JobStatus::Pending));

    // A new processor over the same store finishes the rest
    let bus = capsule_agent::events::EventBus::default();
    bus.start();
    let second = MessageProcessor::new(fast_config(), store.clone(), bus);
    let resumed = Arc::new(RecordingWorker::default());
    second.register_worker("record", resumed.clone()).unwrap();
    second.start().await.unwrap();

    assert!(eventually(WAIT, || resumed.seen().len() == 2).await);
    let mut seen = resumed.seen();
    seen.sort();
    let mut expected = ids[1..].to_vec();
    expected.sort();
    assert_eq!(seen, expected);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_jobs_abandoned_mid_flight_are_recovered() {
    let (processor, store, _bus) = processor(fast_config());

    let mut abandoned = Job::new("record", json!({}));
    abandoned.status = JobStatus::Processing;
    store.save(&abandoned).await.unwrap();
    let queued = Job::new("record", json!({}));
    store.save(&queued).await.unwrap();
    let mut finished = Job::new("record", json!({}));
    finished.status = JobStatus::Done;
    store.save(&finished).await.unwrap();

    let worker = Arc::new(RecordingWorker::default());
    processor.register_worker("record", worker.clone()).unwrap();
    processor.start().await.unwrap();

    assert!(eventually(WAIT, || worker.seen().len() == 2).await);
    let seen = worker.seen();
    assert!(seen.contains(&abandoned.id));
    assert!(seen.contains(&queued.id));
    assert!(!seen.contains(&finished.id));

    let mut recovered = None;
    for _ in 0..100 {
        let job = processor.job(&abandoned.id).await.unwrap().unwrap();
        if job.status == JobStatus::Done {
            recovered = Some(job);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(recovered.is_some(), "abandoned job was not finished");
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_drain_timeout_reports_abandoned_jobs() {
    let (processor, store, _bus) = processor(ProcessorConfig {
        workers: 1,
        drain_timeout: Duration::from_millis(100),
        ..fast_config()
    });
    processor
        .register_worker(
            "slow",
            Arc::new(SlowWorker {
                delay: Duration::from_secs(30),
            }),
        )
        .unwrap();
    processor.start().await.unwrap();

    let id = processor.submit("slow", json!({})).await.unwrap();
    assert!(eventually(WAIT, || processor.stats().in_flight == 1).await);

    match processor.stop().await {
        Err(ProcessorError::DrainTimeout { abandoned }) => assert_eq!(abandoned, vec![id.clone()]),
        other => panic!("expected drain timeout, got {other:?}"),
    }

    // Left in flight for recovery by the next start
    let job = store.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}
