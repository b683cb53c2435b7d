// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker for `install-capsule` jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use capsule_core::{Backend, CapsuleState, Job, NewCapsule};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::client::{ClientError, ClientService};
use crate::message_processor::{JobError, Worker};

/// Job type handled by [`InstallCapsuleWorker`].
pub const INSTALL_CAPSULE_JOB_TYPE: &str = "install-capsule";

/// Payload of an `install-capsule` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallCapsulePayload {
    /// Capsule to install.
    pub capsule_id: String,
    /// Name for a capsule that is not registered yet (defaults to the id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Backend for a capsule that is not registered yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    /// Creation metadata for a capsule that is not registered yet.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl InstallCapsulePayload {
    /// Payload that registers the capsule if needed. A capsule id is
    /// generated when the request has none.
    pub fn from_request(request: NewCapsule) -> Self {
        Self {
            capsule_id: request
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: Some(request.name),
            backend: Some(request.backend),
            metadata: request.metadata,
        }
    }

    /// Payload for an already registered capsule.
    pub fn existing(capsule_id: impl Into<String>) -> Self {
        Self {
            capsule_id: capsule_id.into(),
            name: None,
            backend: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Drives a capsule through installation via the client service.
///
/// Retry and durability are left to the message processor. While an earlier
/// attempt's install is still running, later attempts fail as retryable.
pub struct InstallCapsuleWorker {
    client: Arc<ClientService>,
}

impl InstallCapsuleWorker {
    /// Create a worker using `client`.
    pub fn new(client: Arc<ClientService>) -> Self {
        Self { client }
    }

    async fn ensure_registered(&self, payload: &InstallCapsulePayload) -> Result<(), JobError> {
        match self.client.get(&payload.capsule_id).await {
            Ok(_) => return Ok(()),
            Err(ClientError::NotFound(_)) => {}
            Err(e) => return Err(JobError::retryable(e)),
        }

        let backend = payload.backend.ok_or_else(|| {
            JobError::permanent(format!(
                "capsule {} is not registered and the job names no backend",
                payload.capsule_id
            ))
        })?;
        let mut request = NewCapsule::new(
            payload.name.clone().unwrap_or_else(|| payload.capsule_id.clone()),
            backend,
        )
        .with_id(payload.capsule_id.clone());
        request.metadata = payload.metadata.clone();

        match self.client.register(request).await {
            Ok(_) | Err(ClientError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}

/// Map a client error to the processor's retry policy.
fn classify(err: ClientError) -> JobError {
    match err {
        ClientError::Driver { .. } | ClientError::Store(_) => JobError::retryable(err),
        ClientError::InvalidTransition { from, .. } if from.is_in_flight() => {
            JobError::retryable(err)
        }
        _ => JobError::permanent(err),
    }
}

#[async_trait]
impl Worker for InstallCapsuleWorker {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: InstallCapsulePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid install-capsule payload: {e}")))?;

        self.ensure_registered(&payload).await?;

        // Runs detached so a timed-out or aborted attempt cannot cancel the
        // driver calls between `Installing` and its outcome.
        let client = self.client.clone();
        let capsule_id = payload.capsule_id.clone();
        let install = tokio::spawn(async move { client.install(&capsule_id).await });
        let result = install
            .await
            .map_err(|e| JobError::retryable(format!("install task failed: {e}")))?;

        match result {
            Ok(capsule) => {
                info!(job_id = %job.id, capsule_id = %capsule.id, "Capsule installed");
                Ok(())
            }
            Err(ClientError::InvalidTransition {
                from: CapsuleState::Running,
                ..
            }) => {
                debug!(job_id = %job.id, capsule_id = %payload.capsule_id, "Capsule already running");
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }
}
