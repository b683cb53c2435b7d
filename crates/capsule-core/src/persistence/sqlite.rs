// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use super::{CapsuleFilter, CapsuleStore, MessageStore};
use crate::capsule::{Capsule, CapsuleState};
use crate::error::{Result, StoreError};
use crate::job::Job;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed capsule and message store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct CapsuleRow {
    id: String,
    name: String,
    backend: String,
    state: String,
    last_error: Option<String>,
    metadata: String,
    runtime_handle: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CapsuleRow> for Capsule {
    type Error = StoreError;

    fn try_from(row: CapsuleRow) -> Result<Self> {
        let metadata: BTreeMap<String, String> = serde_json::from_str(&row.metadata)?;
        Ok(Capsule {
            id: row.id,
            name: row.name,
            backend: row.backend.parse()?,
            state: row.state.parse()?,
            last_error: row.last_error,
            metadata,
            runtime_handle: row.runtime_handle,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    payload: String,
    status: String,
    retry_count: i64,
    max_retries: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            payload: serde_json::from_str(&row.payload)?,
            status: row.status.parse()?,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
            last_error: row.last_error,
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
        })
    }
}

impl SqliteStore {
    /// Create a store from an existing, already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL (e.g. `sqlite:.data/agent.db?mode=rwc`) and
    /// run the embedded migrations.
    ///
    /// The parent directory of a file database is created if missing.
    pub async fn connect(url: &str) -> Result<Self> {
        if let Some(parent) = database_dir(url) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        info!(url = %url, "SQLite store ready");
        Ok(Self { pool })
    }

    /// Create the database file (and parent directories) at `path`, connect,
    /// and run the embedded migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Parent directory of the database file named by a `sqlite:` URL.
fn database_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite:")?.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(':') {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
}

#[async_trait]
impl CapsuleStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Capsule>> {
        let row = sqlx::query_as::<_, CapsuleRow>(
            r#"
            SELECT id, name, backend, state, last_error, metadata, runtime_handle,
                   created_at, updated_at
            FROM capsules
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Capsule::try_from).transpose()
    }

    async fn upsert(&self, capsule: &Capsule) -> Result<()> {
        let metadata = serde_json::to_string(&capsule.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO capsules (id, name, backend, state, last_error, metadata,
                                  runtime_handle, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                state = excluded.state,
                last_error = excluded.last_error,
                metadata = excluded.metadata,
                runtime_handle = excluded.runtime_handle,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&capsule.id)
        .bind(&capsule.name)
        .bind(capsule.backend.as_str())
        .bind(capsule.state.as_str())
        .bind(&capsule.last_error)
        .bind(metadata)
        .bind(&capsule.runtime_handle)
        .bind(capsule.created_at)
        .bind(capsule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, filter: &CapsuleFilter) -> Result<Vec<Capsule>> {
        let mut sql = String::from(
            "SELECT id, name, backend, state, last_error, metadata, runtime_handle, \
             created_at, updated_at FROM capsules WHERE 1 = 1",
        );
        let mut binds: Vec<&'static str> = Vec::new();

        match &filter.states {
            Some(states) if states.is_empty() => return Ok(Vec::new()),
            Some(states) => {
                let placeholders = vec!["?"; states.len()].join(", ");
                sql.push_str(&format!(" AND state IN ({placeholders})"));
                binds.extend(states.iter().map(CapsuleState::as_str));
            }
            None if !filter.include_removed => {
                sql.push_str(" AND state <> ?");
                binds.push(CapsuleState::Removed.as_str());
            }
            None => {}
        }
        if let Some(backend) = filter.backend {
            sql.push_str(" AND backend = ?");
            binds.push(backend.as_str());
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut query = sqlx::query_as::<_, CapsuleRow>(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(Capsule::try_from).collect()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(&job.payload)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, payload, status, retry_count, max_retries,
                              last_error, created_at, last_attempt_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                last_error = excluded.last_error,
                last_attempt_at = excluded.last_attempt_at
            "#,
        )
        .bind(&job.id)
        .bind(&job.job_type)
        .bind(payload)
        .bind(job.status.as_str())
        .bind(i64::from(job.retry_count))
        .bind(i64::from(job.max_retries))
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.last_attempt_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_pending(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_type, payload, status, retry_count, max_retries,
                   last_error, created_at, last_attempt_at
            FROM jobs
            WHERE status IN ('pending', 'processing')
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, job_type, payload, status, retry_count, max_retries,
                   last_error, created_at, last_attempt_at
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }
}
