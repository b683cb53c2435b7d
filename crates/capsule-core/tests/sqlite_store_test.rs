// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the SQLite-backed capsule and message stores.

use capsule_core::persistence::{CapsuleFilter, CapsuleStore, MessageStore, SqliteStore};
use capsule_core::{Backend, CapsuleState, Job, JobStatus, NewCapsule};
use serde_json::json;
use tempfile::TempDir;

async fn open_store() -> (SqliteStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = SqliteStore::from_path(temp_dir.path().join("nested").join("agent.db"))
        .await
        .expect("Failed to open SQLite store");
    (store, temp_dir)
}

#[tokio::test]
async fn test_capsule_round_trip_keeps_metadata_and_handle() {
    let (store, _dir) = open_store().await;

    let mut capsule = NewCapsule::new("web-1", Backend::Docker)
        .with_id("capsule-1")
        .with_meta("image", "nginx:alpine")
        .with_meta("memory", "256m")
        .into_capsule();
    capsule.runtime_handle = Some("abc123".to_string());
    store.upsert(&capsule).await.unwrap();

    let loaded = store.get("capsule-1").await.unwrap().expect("capsule missing");
    assert_eq!(loaded.name, "web-1");
    assert_eq!(loaded.backend, Backend::Docker);
    assert_eq!(loaded.state, CapsuleState::Requested);
    assert_eq!(loaded.meta("image"), Some("nginx:alpine"));
    assert_eq!(loaded.meta("memory"), Some("256m"));
    assert_eq!(loaded.runtime_handle.as_deref(), Some("abc123"));

    assert!(store.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_capsule_upsert_updates_state_and_error() {
    let (store, _dir) = open_store().await;

    let mut capsule = NewCapsule::new("web-2", Backend::Lxc)
        .with_id("capsule-2")
        .into_capsule();
    store.upsert(&capsule).await.unwrap();

    capsule.state = CapsuleState::Failed;
    capsule.last_error = Some("lxc-create: template not found".to_string());
    store.upsert(&capsule).await.unwrap();

    let loaded = store.get("capsule-2").await.unwrap().unwrap();
    assert_eq!(loaded.state, CapsuleState::Failed);
    assert_eq!(
        loaded.last_error.as_deref(),
        Some("lxc-create: template not found")
    );
    assert_eq!(store.list(&CapsuleFilter::all()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_capsule_list_filters() {
    let (store, _dir) = open_store().await;

    let states = [
        ("a", Backend::Docker, CapsuleState::Running),
        ("b", Backend::Lxc, CapsuleState::Running),
        ("c", Backend::Docker, CapsuleState::Stopped),
        ("d", Backend::Docker, CapsuleState::Removed),
    ];
    for (id, backend, state) in states {
        let mut capsule = NewCapsule::new(id, backend).with_id(id).into_capsule();
        capsule.state = state;
        store.upsert(&capsule).await.unwrap();
    }

    let running = store
        .list(&CapsuleFilter::in_state(CapsuleState::Running))
        .await
        .unwrap();
    assert_eq!(running.len(), 2);

    let running_docker = store
        .list(&CapsuleFilter::in_state(CapsuleState::Running).on_backend(Backend::Docker))
        .await
        .unwrap();
    assert_eq!(running_docker.len(), 1);
    assert_eq!(running_docker[0].id, "a");

    let active = store.list(&CapsuleFilter::active()).await.unwrap();
    assert_eq!(active.len(), 3);
    assert!(active.iter().all(|c| c.state != CapsuleState::Removed));

    let everything = store.list(&CapsuleFilter::all()).await.unwrap();
    assert_eq!(everything.len(), 4);

    let none = CapsuleFilter {
        states: Some(vec![]),
        ..CapsuleFilter::default()
    };
    assert!(store.list(&none).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_job_save_and_load_pending() {
    let (store, _dir) = open_store().await;

    let pending = Job::new("install-capsule", json!({"capsule_id": "c1"}));
    let mut processing = Job::new("notification", json!({"title": "hi"}));
    processing.status = JobStatus::Processing;
    processing.last_attempt_at = Some(chrono::Utc::now());
    let mut failed = Job::new("install-capsule", json!({}));
    failed.status = JobStatus::Failed;
    failed.retry_count = 3;
    failed.last_error = Some("boom".to_string());

    for job in [&pending, &processing, &failed] {
        store.save(job).await.unwrap();
    }

    let loaded = store.load_pending().await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().any(|j| j.id == pending.id));
    assert!(loaded.iter().any(|j| j.id == processing.id));

    let reloaded = store.get_job(&failed.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, JobStatus::Failed);
    assert_eq!(reloaded.retry_count, 3);
    assert_eq!(reloaded.last_error.as_deref(), Some("boom"));
    assert_eq!(reloaded.payload, json!({}));
}

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("agent.db");

    let job = Job::new("install-capsule", json!({"capsule_id": "c9"})).with_max_retries(5);
    {
        let store = SqliteStore::from_path(&path).await.unwrap();
        store.save(&job).await.unwrap();
        store.pool().close().await;
    }

    let store = SqliteStore::from_path(&path).await.unwrap();
    let loaded = store.load_pending().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, job.id);
    assert_eq!(loaded[0].max_retries, 5);
    assert_eq!(loaded[0].payload, json!({"capsule_id": "c9"}));
}
