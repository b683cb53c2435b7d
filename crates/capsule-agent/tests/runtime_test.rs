// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the embeddable agent runtime with the mock driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use capsule_agent::capsule::{ReconcilerConfig, StatsMonitorConfig};
use capsule_agent::driver::{MockDriver, MockOp};
use capsule_agent::events::{EventPayload, NotificationLevel};
use capsule_agent::message_processor::{EmailPayload, MailError, NotificationPayload, ProcessorError};
use capsule_agent::runtime::AgentRuntime;
use capsule_core::persistence::{MemoryCapsuleStore, MemoryMessageStore};
use capsule_core::{Backend, CapsuleState, JobStatus, NewCapsule};

use common::{ScriptedMailer, fast_config, wait_for_event};

const WAIT: Duration = Duration::from_secs(5);

async fn start_runtime(driver: Arc<MockDriver>, max_retries: u32) -> AgentRuntime {
    AgentRuntime::builder()
        .capsule_store(Arc::new(MemoryCapsuleStore::new()))
        .message_store(Arc::new(MemoryMessageStore::new()))
        .driver(driver)
        .processor_config(capsule_agent::message_processor::ProcessorConfig {
            default_max_retries: max_retries,
            ..fast_config()
        })
        .stats_config(StatsMonitorConfig {
            interval: Duration::from_millis(20),
            ..StatsMonitorConfig::default()
        })
        .reconciler_config(ReconcilerConfig {
            poll_interval: Duration::from_millis(50),
        })
        .bus_drain_window(Duration::from_millis(50))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_install_job_runs_capsule_and_streams_events() {
    let driver = Arc::new(MockDriver::new(Backend::Docker));
    let runtime = start_runtime(driver.clone(), 3).await;
    let mut sub = runtime.subscribe().unwrap();

    let capsule_id = runtime
        .request_install(
            NewCapsule::new("web-1", Backend::Docker).with_meta("image", "nginx:alpine"),
        )
        .await
        .unwrap();

    let completed = wait_for_event(&mut sub, WAIT, |payload| {
        matches!(payload, EventPayload::JobCompleted { .. })
    })
    .await
    .unwrap();
    assert!(matches!(
        &completed.payload,
        EventPayload::JobCompleted {
            status: JobStatus::Done,
            ..
        }
    ));

    let capsule = runtime.client().get(&capsule_id).await.unwrap();
    assert_eq!(capsule.state, CapsuleState::Running);
    assert_eq!(capsule.name, "web-1");
    assert_eq!(capsule.meta("image"), Some("nginx:alpine"));

    // Stats follow for the running capsule
    let stats = wait_for_event(&mut sub, WAIT, |payload| {
        matches!(payload, EventPayload::CapsuleStats { .. })
    })
    .await
    .unwrap();
    match &stats.payload {
        EventPayload::CapsuleStats { capsule_id: id, .. } => assert_eq!(id, &capsule_id),
        other => panic!("unexpected event {other:?}"),
    }

    runtime.shutdown().await.unwrap();
    assert_eq!(driver.call_count(MockOp::Create), 1);
}

#[tokio::test]
async fn test_install_state_changes_are_ordered() {
    let driver = Arc::new(MockDriver::new(Backend::Docker));
    let runtime = start_runtime(driver, 3).await;
    let mut sub = runtime.subscribe().unwrap();

    runtime
        .request_install(NewCapsule::new("web-1", Backend::Docker).with_id("web-1"))
        .await
        .unwrap();

    let mut changes = Vec::new();
    while changes.len() < 2 {
        let event = wait_for_event(&mut sub, WAIT, |payload| {
            matches!(payload, EventPayload::CapsuleStateChanged { .. })
        })
        .await
        .unwrap();
        if let EventPayload::CapsuleStateChanged { from, to, .. } = &event.payload {
            changes.push((*from, *to));
        }
    }
    assert_eq!(
        changes,
        vec![
            (CapsuleState::Requested, CapsuleState::Installing),
            (CapsuleState::Installing, CapsuleState::Running),
        ]
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_install_is_retried_then_reported() {
    let driver = Arc::new(MockDriver::new(Backend::Docker));
    driver.fail(MockOp::Create, "image not found");
    let runtime = start_runtime(driver.clone(), 1).await;
    let mut sub = runtime.subscribe().unwrap();

    let capsule_id = runtime
        .request_install(NewCapsule::new("web-2", Backend::Docker))
        .await
        .unwrap();

    let completed = wait_for_event(&mut sub, WAIT, |payload| {
        matches!(payload, EventPayload::JobCompleted { .. })
    })
    .await
    .unwrap();
    match &completed.payload {
        EventPayload::JobCompleted {
            status,
            retry_count,
            error,
            ..
        } => {
            assert_eq!(*status, JobStatus::Failed);
            assert_eq!(*retry_count, 1);
            assert!(error.as_deref().unwrap().contains("image not found"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_eq!(driver.call_count(MockOp::Create), 2);
    let capsule = runtime.client().get(&capsule_id).await.unwrap();
    assert_eq!(capsule.state, CapsuleState::Failed);
    assert!(capsule.last_error.unwrap().contains("image not found"));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_notification_job_reaches_subscribers() {
    let runtime = start_runtime(Arc::new(MockDriver::new(Backend::Lxc)), 3).await;
    let mut sub = runtime.subscribe().unwrap();

    runtime
        .notify(NotificationPayload {
            title: "Disk space low".to_string(),
            message: "/var at 91%".to_string(),
            level: NotificationLevel::Warning,
        })
        .await
        .unwrap();

    let event = wait_for_event(&mut sub, WAIT, |payload| {
        matches!(payload, EventPayload::Notification { .. })
    })
    .await
    .unwrap();
    assert_eq!(
        event.payload,
        EventPayload::Notification {
            title: "Disk space low".to_string(),
            message: "/var at 91%".to_string(),
            level: NotificationLevel::Warning,
        }
    );

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_subscriptions() {
    let runtime = start_runtime(Arc::new(MockDriver::new(Backend::Docker)), 3).await;
    assert!(runtime.is_running());
    let mut sub = runtime.subscribe().unwrap();
    let bus = runtime.bus().clone();

    runtime.shutdown().await.unwrap();

    assert!(!bus.is_running());
    while sub.recv().await.is_some() {}
    assert!(bus.subscribe().is_err());
}

#[tokio::test]
async fn test_capsule_and_job_records_survive_restart() {
    use capsule_core::persistence::{CapsuleStore, MessageStore, SqliteStore};

    let temp_dir = tempfile::TempDir::new().unwrap();
    let db_path = temp_dir.path().join("agent.db");

    let store = Arc::new(SqliteStore::from_path(&db_path).await.unwrap());
    let runtime = AgentRuntime::builder()
        .capsule_store(store.clone())
        .message_store(store.clone())
        .driver(Arc::new(MockDriver::new(Backend::Docker)))
        .processor_config(fast_config())
        .bus_drain_window(Duration::from_millis(50))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let mut sub = runtime.subscribe().unwrap();

    let capsule_id = runtime
        .request_install(NewCapsule::new("db-1", Backend::Docker).with_meta("image", "postgres:16"))
        .await
        .unwrap();
    let completed = wait_for_event(&mut sub, WAIT, |payload| {
        matches!(payload, EventPayload::JobCompleted { .. })
    })
    .await
    .unwrap();
    let job_id = match &completed.payload {
        EventPayload::JobCompleted { job_id, .. } => job_id.clone(),
        other => panic!("unexpected event {other:?}"),
    };
    runtime.shutdown().await.unwrap();
    drop(store);

    let reopened = SqliteStore::from_path(&db_path).await.unwrap();
    let capsule = CapsuleStore::get(&reopened, &capsule_id).await.unwrap().unwrap();
    assert_eq!(capsule.state, CapsuleState::Running);
    assert_eq!(capsule.meta("image"), Some("postgres:16"));
    assert_eq!(capsule.runtime_handle.as_deref(), Some(format!("mock-{capsule_id}").as_str()));

    let job = reopened.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert!(reopened.load_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_startup_resolves_capsules_left_mid_operation() {
    use capsule_core::persistence::CapsuleStore;

    let store = Arc::new(MemoryCapsuleStore::new());
    let mut stranded = NewCapsule::new("web-1", Backend::Docker)
        .with_id("web-1")
        .into_capsule();
    stranded.state = CapsuleState::Stopping;
    store.upsert(&stranded).await.unwrap();

    let runtime = AgentRuntime::builder()
        .capsule_store(store)
        .message_store(Arc::new(MemoryMessageStore::new()))
        .driver(Arc::new(MockDriver::new(Backend::Docker)))
        .processor_config(fast_config())
        .bus_drain_window(Duration::from_millis(50))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let capsule = runtime.client().get("web-1").await.unwrap();
    assert_eq!(capsule.state, CapsuleState::Failed);
    assert_eq!(
        capsule.last_error.as_deref(),
        Some("stop interrupted before completion")
    );

    runtime.shutdown().await.unwrap();
}

async fn start_with_mailer(mailer: Arc<ScriptedMailer>) -> AgentRuntime {
    AgentRuntime::builder()
        .capsule_store(Arc::new(MemoryCapsuleStore::new()))
        .message_store(Arc::new(MemoryMessageStore::new()))
        .driver(Arc::new(MockDriver::new(Backend::Docker)))
        .mailer(mailer)
        .processor_config(fast_config())
        .bus_drain_window(Duration::from_millis(50))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

fn alert_email() -> EmailPayload {
    EmailPayload {
        to: vec!["ops@example.com".to_string()],
        subject: "Capsule web-1 failed".to_string(),
        body: "image not found".to_string(),
    }
}

async fn completion(runtime: &AgentRuntime, email: EmailPayload) -> (JobStatus, u32) {
    let mut sub = runtime.subscribe().unwrap();
    let job_id = runtime.send_email(email).await.unwrap();
    let event = wait_for_event(&mut sub, WAIT, |payload| {
        matches!(payload, EventPayload::JobCompleted { job_id: id, .. } if id == &job_id)
    })
    .await
    .unwrap();
    match &event.payload {
        EventPayload::JobCompleted {
            job_type,
            status,
            retry_count,
            ..
        } => {
            assert_eq!(job_type, "email");
            (*status, *retry_count)
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_email_job_is_delivered_through_mailer() {
    let mailer = Arc::new(ScriptedMailer::default());
    let runtime = start_with_mailer(mailer.clone()).await;

    assert_eq!(completion(&runtime, alert_email()).await, (JobStatus::Done, 0));
    assert_eq!(mailer.sent(), vec![alert_email()]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_mail_server_is_retried() {
    let mailer = Arc::new(ScriptedMailer::failing_with([
        MailError::Unavailable("connection refused".into()),
        MailError::Unavailable("421 try again later".into()),
    ]));
    let runtime = start_with_mailer(mailer.clone()).await;

    assert_eq!(completion(&runtime, alert_email()).await, (JobStatus::Done, 2));
    assert_eq!(mailer.attempts(), 3);
    assert_eq!(mailer.sent().len(), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_email_fails_without_retry() {
    let mailer = Arc::new(ScriptedMailer::failing_with([MailError::Rejected(
        "550 no such user".into(),
    )]));
    let runtime = start_with_mailer(mailer.clone()).await;

    assert_eq!(completion(&runtime, alert_email()).await, (JobStatus::Failed, 0));
    assert_eq!(mailer.attempts(), 1);
    assert!(mailer.sent().is_empty());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_email_rejected_without_mailer() {
    let runtime = start_runtime(Arc::new(MockDriver::new(Backend::Docker)), 3).await;

    let err = runtime.send_email(alert_email()).await.unwrap_err();
    assert!(matches!(err, ProcessorError::UnknownJobType(job_type) if job_type == "email"));

    runtime.shutdown().await.unwrap();
}
