// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job record for the message processor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseEnumError;

/// Default retry budget for new jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Processing status of a job.
///
/// Moves only `Pending -> Processing -> {Done, Failed}`. A retryable failure
/// with budget left puts the job back to `Pending` with `retry_count + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a dispatcher.
    Pending,
    /// Handed to exactly one worker.
    Processing,
    /// Completed successfully.
    Done,
    /// Failed permanently.
    Failed,
}

impl JobStatus {
    /// Stable snake_case name used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether the job has reached `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("job status", s)),
        }
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: String,
    /// Tag matching a registered worker.
    pub job_type: String,
    /// Worker-interpreted payload.
    pub payload: Value,
    /// Current status.
    pub status: JobStatus,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retries allowed before the job fails permanently.
    pub max_retries: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the most recent attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job with the default retry budget.
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            created_at: Utc::now(),
            last_attempt_at: None,
        }
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another attempt is allowed after a retryable failure.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
