// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker that turns `notification` jobs into bus events.

use async_trait::async_trait;
use capsule_core::Job;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::worker::{JobError, Worker};
use crate::events::{Event, EventBus, EventPayload, NotificationLevel};

/// Job type handled by [`NotificationWorker`].
pub const NOTIFICATION_JOB_TYPE: &str = "notification";

/// Payload of a `notification` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Short title
    pub title: String,
    /// Body text
    #[serde(default)]
    pub message: String,
    /// Severity
    #[serde(default)]
    pub level: NotificationLevel,
}

/// Publishes each notification job as a [`EventPayload::Notification`] event.
pub struct NotificationWorker {
    bus: EventBus,
}

impl NotificationWorker {
    /// Create a worker publishing on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Worker for NotificationWorker {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload: NotificationPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid notification payload: {e}")))?;
        if payload.title.trim().is_empty() {
            return Err(JobError::permanent("notification title is empty"));
        }

        let delivered = self.bus.publish(Event::new(EventPayload::Notification {
            title: payload.title,
            message: payload.message,
            level: payload.level,
        }));
        debug!(job_id = %job.id, subscribers = delivered, "Notification published");
        Ok(())
    }
}
