// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capsule record and lifecycle edge table.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;

/// Container runtime a capsule runs on. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Docker container.
    Docker,
    /// LXC system container.
    Lxc,
}

impl Backend {
    /// Stable lowercase name used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Lxc => "lxc",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "lxc" => Ok(Self::Lxc),
            _ => Err(ParseEnumError::new("backend", s)),
        }
    }
}

/// Lifecycle state of a capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleState {
    /// Recorded, nothing provisioned yet.
    Requested,
    /// Driver create/start in flight.
    Installing,
    /// Running on its backend.
    Running,
    /// Driver stop in flight.
    Stopping,
    /// Stopped on its backend; can be started again.
    Stopped,
    /// Last operation failed; see `last_error`.
    Failed,
    /// Destroyed. Terminal.
    Removed,
}

impl CapsuleState {
    /// All states, in lifecycle order.
    pub const ALL: [CapsuleState; 7] = [
        Self::Requested,
        Self::Installing,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Failed,
        Self::Removed,
    ];

    /// Stable snake_case name used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    ///
    /// `Failed` accepts the edges of the operations that can be re-attempted
    /// from it (install/start and stop). `Removed` has no outgoing edges.
    pub fn can_transition_to(&self, next: CapsuleState) -> bool {
        use CapsuleState::*;
        matches!(
            (self, next),
            (Requested, Installing)
                | (Installing, Running)
                | (Installing, Failed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Installing)
                | (Failed, Installing)
                | (Failed, Stopping)
                | (Running, Removed)
                | (Stopped, Removed)
                | (Failed, Removed)
        )
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Whether a driver operation owns the capsule right now.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Installing | Self::Stopping)
    }
}

impl fmt::Display for CapsuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapsuleState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("capsule state", s))
    }
}

/// A managed workload instance.
///
/// The capsule client service is the only writer of `state` and `last_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    /// Stable unique identifier.
    pub id: String,
    /// Human-readable name (also used as the runtime object name).
    pub name: String,
    /// Runtime this capsule is placed on.
    pub backend: Backend,
    /// Current lifecycle state.
    pub state: CapsuleState,
    /// Diagnostic from the last failed operation.
    pub last_error: Option<String>,
    /// Creation-time configuration (image/template reference, resource limits).
    pub metadata: BTreeMap<String, String>,
    /// Driver handle of the underlying runtime object, once created.
    pub runtime_handle: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the last transition was applied.
    pub updated_at: DateTime<Utc>,
}

impl Capsule {
    /// Look up a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Request to record a new capsule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCapsule {
    /// Explicit id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Human-readable name.
    pub name: String,
    /// Runtime to place the capsule on.
    pub backend: Backend,
    /// Creation-time configuration.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NewCapsule {
    /// Create a request with no metadata.
    pub fn new(name: impl Into<String>, backend: Backend) -> Self {
        Self {
            id: None,
            name: name.into(),
            backend,
            metadata: BTreeMap::new(),
        }
    }

    /// Use a caller-chosen id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Build the `Requested` record.
    pub fn into_capsule(self) -> Capsule {
        let now = Utc::now();
        Capsule {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: self.name,
            backend: self.backend,
            state: CapsuleState::Requested,
            last_error: None,
            metadata: self.metadata,
            runtime_handle: None,
            created_at: now,
            updated_at: now,
        }
    }
}
