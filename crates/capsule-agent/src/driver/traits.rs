// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Driver trait definitions.
//!
//! Defines the capability contract every container backend implements.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use capsule_core::Backend;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from driver operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The runtime CLI could not be executed.
    #[error("Runtime binary not found: {0}")]
    BinaryNotFound(String),

    /// The runtime object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The call did not finish in time.
    #[error("Driver call timed out after {0:?}")]
    Timeout(Duration),

    /// Required creation metadata is missing or malformed.
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// The runtime CLI exited with a non-zero code.
    #[error("{command} exited with code {exit_code}: {stderr}")]
    ExitCode {
        /// Runtime command that failed (e.g. `docker create`).
        command: String,
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// The runtime answered with output that could not be understood.
    #[error("Unexpected output from {command}: {detail}")]
    Parse {
        /// Runtime command whose output was rejected.
        command: String,
        /// What was wrong with it.
        detail: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Everything a driver needs to create the runtime object for a capsule.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    /// Capsule id, attached to the runtime object as a label where supported.
    pub capsule_id: String,
    /// Runtime object name.
    pub name: String,
    /// Creation-time configuration (image/template reference, resource limits).
    pub metadata: BTreeMap<String, String>,
}

impl CreateSpec {
    /// Look up a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Look up a required metadata value.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.meta(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| DriverError::InvalidSpec(format!("missing metadata '{key}'")))
    }
}

/// Observed state of a runtime object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    /// The object exists and is running.
    Running,
    /// The object exists and is not running.
    Stopped,
    /// No such object.
    Missing,
    /// The object exists in a state the agent does not model (e.g. paused).
    Unknown,
}

/// Point-in-time resource usage of a running capsule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapsuleMetrics {
    /// CPU usage as a percentage of one core
    pub cpu_percent: Option<f64>,
    /// Current memory usage in bytes
    pub memory_bytes: Option<u64>,
    /// Memory limit in bytes
    pub memory_limit_bytes: Option<u64>,
    /// Bytes received over the network
    pub net_rx_bytes: Option<u64>,
    /// Bytes sent over the network
    pub net_tx_bytes: Option<u64>,
    /// Number of processes/tasks
    pub pids: Option<u64>,
}

/// Capability contract of a container backend.
///
/// Drivers never touch capsule records; they operate on the runtime object
/// identified by the handle returned from [`Driver::create`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend this driver serves.
    fn backend(&self) -> Backend;

    /// Check that the runtime is installed and reachable.
    async fn probe(&self) -> Result<()>;

    /// Create the runtime object and return its handle.
    async fn create(&self, spec: &CreateSpec) -> Result<String>;

    /// Start a created object.
    async fn start(&self, handle: &str) -> Result<()>;

    /// Stop a running object.
    async fn stop(&self, handle: &str) -> Result<()>;

    /// Destroy the object. Destroying a missing object is not an error.
    async fn destroy(&self, handle: &str) -> Result<()>;

    /// Observe the object's status.
    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus>;

    /// Sample resource usage.
    async fn stats(&self, handle: &str) -> Result<CapsuleMetrics>;
}
