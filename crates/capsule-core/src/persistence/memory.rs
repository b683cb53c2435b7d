// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process stores for tests and for running without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CapsuleFilter, CapsuleStore, MessageStore};
use crate::capsule::Capsule;
use crate::error::Result;
use crate::job::{Job, JobStatus};

/// Capsule store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryCapsuleStore {
    capsules: RwLock<HashMap<String, Capsule>>,
}

impl MemoryCapsuleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CapsuleStore for MemoryCapsuleStore {
    async fn get(&self, id: &str) -> Result<Option<Capsule>> {
        Ok(self.capsules.read().await.get(id).cloned())
    }

    async fn upsert(&self, capsule: &Capsule) -> Result<()> {
        self.capsules
            .write()
            .await
            .insert(capsule.id.clone(), capsule.clone());
        Ok(())
    }

    async fn list(&self, filter: &CapsuleFilter) -> Result<Vec<Capsule>> {
        let mut capsules: Vec<Capsule> = self
            .capsules
            .read()
            .await
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        capsules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(capsules)
    }
}

/// Message store backed by a `HashMap`. Not durable.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every saved job, oldest first.
    pub async fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Job>> {
        Ok(self
            .all()
            .await
            .into_iter()
            .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Processing))
            .collect())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }
}
