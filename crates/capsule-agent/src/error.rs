// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for capsule-agent.

use thiserror::Error;

/// Agent errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Capsule lifecycle operation failed.
    #[error("Capsule error: {0}")]
    Client(#[from] crate::capsule::ClientError),

    /// Job submission or processing failed.
    #[error("Message processor error: {0}")]
    Processor(#[from] crate::message_processor::ProcessorError),

    /// Event bus operation failed.
    #[error("Event bus error: {0}")]
    Bus(#[from] crate::events::BusError),

    /// Backend driver failed.
    #[error("Driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),

    /// Persistence failed.
    #[error("Store error: {0}")]
    Store(#[from] capsule_core::StoreError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using agent Error.
pub type Result<T> = std::result::Result<T, Error>;
