// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker trait definitions.

use std::fmt::Display;

use async_trait::async_trait;
use capsule_core::Job;
use thiserror::Error;

/// Typed failure returned by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Worth another attempt; the processor retries while budget remains.
    #[error("{0}")]
    Retryable(String),

    /// Retrying cannot help (bad payload, unknown capsule, ...).
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    /// Retryable failure from any displayable error.
    pub fn retryable(err: impl Display) -> Self {
        Self::Retryable(err.to_string())
    }

    /// Permanent failure from any displayable error.
    pub fn permanent(err: impl Display) -> Self {
        Self::Permanent(err.to_string())
    }

    /// Whether the processor may retry the job.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Handler for one job type.
///
/// A worker contains no retry logic of its own: it reports the outcome of a
/// single attempt and the processor applies the retry policy.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Process one job.
    async fn process(&self, job: &Job) -> Result<(), JobError>;
}
