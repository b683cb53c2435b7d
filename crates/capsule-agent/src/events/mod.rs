// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events broadcast on the agent's event bus.
//!
//! Events are immutable, not persisted, and delivered at most once to each
//! subscriber that is attached when they are published.

mod bus;

pub use bus::{BusConfig, BusError, EventBus, Subscription, DEFAULT_MAX_CONSECUTIVE_DROPS};

use capsule_core::{Backend, CapsuleState, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::CapsuleMetrics;

/// A fact broadcast on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Typed payload; serialized inline with a `type` tag.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload with a fresh id and the current time.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Stable event type tag.
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Severity of a [`EventPayload::Notification`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Informational.
    #[default]
    Info,
    /// Something needs attention.
    Warning,
    /// Something failed.
    Error,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A capsule moved along a lifecycle edge.
    CapsuleStateChanged {
        /// Capsule id
        capsule_id: String,
        /// Capsule name
        name: String,
        /// Capsule backend
        backend: Backend,
        /// State before the transition
        from: CapsuleState,
        /// State after the transition
        to: CapsuleState,
        /// Error detail when `to` is `Failed`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Live resource usage of a running capsule.
    CapsuleStats {
        /// Capsule id
        capsule_id: String,
        /// Capsule name
        name: String,
        /// Capsule backend
        backend: Backend,
        /// Sampled usage
        metrics: CapsuleMetrics,
    },

    /// A job reached a terminal status.
    JobCompleted {
        /// Job id
        job_id: String,
        /// Job type tag
        job_type: String,
        /// `done` or `failed`
        status: JobStatus,
        /// Retries consumed
        retry_count: u32,
        /// Error from the final attempt
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A user-facing notification.
    Notification {
        /// Short title
        title: String,
        /// Body text
        message: String,
        /// Severity
        #[serde(default)]
        level: NotificationLevel,
    },
}

impl EventPayload {
    /// Stable event type tag, matching the serialized `type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CapsuleStateChanged { .. } => "capsule_state_changed",
            Self::CapsuleStats { .. } => "capsule_stats",
            Self::JobCompleted { .. } => "job_completed",
            Self::Notification { .. } => "notification",
        }
    }
}
