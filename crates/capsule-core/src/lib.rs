// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capsule Core - records and persistence for the capsule agent.
//!
//! This crate owns the data model shared by every part of the agent:
//! capsules (managed Docker/LXC workloads), the lifecycle edge table that
//! constrains how a capsule's state may change, and jobs (units of
//! asynchronous work consumed by the message processor).
//!
//! It also defines the two persistence contracts the agent consumes and
//! ships implementations for them:
//!
//! | Contract | Implementations |
//! |----------|-----------------|
//! | [`CapsuleStore`](persistence::CapsuleStore) | [`MemoryCapsuleStore`](persistence::MemoryCapsuleStore), [`SqliteStore`](persistence::SqliteStore) |
//! | [`MessageStore`](persistence::MessageStore) | [`MemoryMessageStore`](persistence::MemoryMessageStore), [`SqliteStore`](persistence::SqliteStore) |
//!
//! # Capsule State Machine
//!
//! ```text
//!   ┌───────────┐  begin install   ┌────────────┐  create+start ok  ┌─────────┐
//!   │ REQUESTED │─────────────────►│ INSTALLING │──────────────────►│ RUNNING │
//!   └───────────┘                  └─────┬──────┘                   └────┬────┘
//!                                        │ create/start fails      stop  │
//!                       start / retry    ▼                               ▼
//!        ┌──────────────────────────┌────────┐  stop fails       ┌──────────┐
//!        │                          │ FAILED │◄──────────────────│ STOPPING │
//!        │                          └────────┘                   └────┬─────┘
//!   ┌─────────┐       stop ok                                         │
//!   │ STOPPED │◄──────────────────────────────────────────────────────┘
//!   └─────────┘
//!
//!   RUNNING | STOPPED | FAILED ──remove──► REMOVED (terminal)
//! ```
//!
//! # Modules
//!
//! - [`capsule`]: capsule record, backend and state enums, edge table
//! - [`job`]: job record and status
//! - [`persistence`]: store contracts and backends
//! - [`error`]: store and parse errors

#![deny(missing_docs)]

/// Capsule record, backend and lifecycle state.
pub mod capsule;

/// Store and parse errors.
pub mod error;

/// Job record for the message processor.
pub mod job;

/// Persistence contracts and their implementations.
pub mod persistence;

pub use capsule::{Backend, Capsule, CapsuleState, NewCapsule};
pub use error::{ParseEnumError, StoreError};
pub use job::{Job, JobStatus};
