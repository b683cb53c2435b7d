// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for capsule-core.
//!
//! The agent only touches shared mutable state through these two contracts.
//! Each call is atomic for a single record; read-modify-write sequences
//! across calls are serialized by the caller (the capsule client service
//! holds a per-capsule lock, a job is owned by one dispatcher at a time).

pub mod memory;
pub mod sqlite;

pub use self::memory::{MemoryCapsuleStore, MemoryMessageStore};
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;

use crate::capsule::{Backend, Capsule, CapsuleState};
use crate::error::Result;
use crate::job::Job;

/// Filter for [`CapsuleStore::list`].
#[derive(Debug, Clone, Default)]
pub struct CapsuleFilter {
    /// Only capsules in one of these states (any state when `None`).
    pub states: Option<Vec<CapsuleState>>,
    /// Only capsules on this backend.
    pub backend: Option<Backend>,
    /// Include `Removed` capsules when no explicit `states` are given.
    pub include_removed: bool,
}

impl CapsuleFilter {
    /// Every capsule that has not been removed.
    pub fn active() -> Self {
        Self::default()
    }

    /// Every capsule, removed ones included.
    pub fn all() -> Self {
        Self {
            include_removed: true,
            ..Self::default()
        }
    }

    /// Capsules in exactly this state.
    pub fn in_state(state: CapsuleState) -> Self {
        Self {
            states: Some(vec![state]),
            ..Self::default()
        }
    }

    /// Restrict to one backend.
    pub fn on_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Whether a capsule passes this filter.
    pub fn matches(&self, capsule: &Capsule) -> bool {
        let state_ok = match &self.states {
            Some(states) => states.contains(&capsule.state),
            None => self.include_removed || capsule.state != CapsuleState::Removed,
        };
        let backend_ok = self.backend.is_none_or(|b| b == capsule.backend);
        state_ok && backend_ok
    }
}

/// Persistent record of known capsules.
#[async_trait]
pub trait CapsuleStore: Send + Sync {
    /// Get a capsule by id.
    async fn get(&self, id: &str) -> Result<Option<Capsule>>;

    /// Insert or replace a capsule record atomically.
    async fn upsert(&self, capsule: &Capsule) -> Result<()>;

    /// List capsules matching a filter, oldest first.
    async fn list(&self, filter: &CapsuleFilter) -> Result<Vec<Capsule>>;
}

/// Durable persistence of jobs across restarts.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or replace a job record atomically.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Jobs that were `Pending` or `Processing` when last saved, oldest first.
    async fn load_pending(&self) -> Result<Vec<Job>>;

    /// Get a job by id.
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;
}
