// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker that delivers `email` jobs through a [`Mailer`].

use std::sync::Arc;

use async_trait::async_trait;
use capsule_core::Job;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::worker::{JobError, Worker};

/// Job type handled by [`EmailWorker`].
pub const EMAIL_JOB_TYPE: &str = "email";

/// Payload of an `email` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Recipient addresses, `user@host` or `Name <user@host>`
    pub to: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    #[serde(default)]
    pub body: String,
}

/// Delivery failure reported by a [`Mailer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    /// The message cannot be built (bad address, bad header).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The server refused the message for good.
    #[error("rejected by mail server: {0}")]
    Rejected(String),

    /// The server could not be reached or deferred the message.
    #[error("mail server unavailable: {0}")]
    Unavailable(String),
}

impl MailError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message.
    async fn send(&self, email: &EmailPayload) -> Result<(), MailError>;
}

/// Sends each email job through the configured [`Mailer`].
///
/// Unreachable or deferring servers are retried; malformed messages and
/// refusals fail the job at once.
pub struct EmailWorker {
    mailer: Arc<dyn Mailer>,
}

impl EmailWorker {
    /// Create a worker delivering through `mailer`.
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Worker for EmailWorker {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let email: EmailPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid email payload: {e}")))?;
        if email.to.iter().all(|to| to.trim().is_empty()) {
            return Err(JobError::permanent("email has no recipients"));
        }

        match self.mailer.send(&email).await {
            Ok(()) => {
                debug!(job_id = %job.id, recipients = email.to.len(), "Email sent");
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id = %job.id, error = %e, "Email delivery deferred");
                Err(JobError::retryable(e))
            }
            Err(e) => Err(JobError::permanent(e)),
        }
    }
}
