// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capsule Agent - Host Orchestration for Docker and LXC Capsules
//!
//! This crate runs on a host and manages capsules (isolated workloads backed
//! by a Docker container or an LXC container) through a single lifecycle
//! state machine. Long-running work is queued as jobs, and everything that
//! happens is published on an in-process event bus for live consumers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Producers (embedding app, capsule-agent)               │
//! └─────────────────────────────────────────────────────────────────────────┘
//!              │ submit jobs                           │ subscribe
//!              ▼                                       │
//! ┌──────────────────────────┐                         │
//! │    Message Processor     │── JobCompleted ──┐      │
//! │  FIFO queue, N workers   │                  │      │
//! └────────────┬─────────────┘                  ▼      ▼
//!              │ install-capsule        ┌─────────────────────────┐
//!              ▼                        │        Event Bus        │
//! ┌──────────────────────────┐          │  bounded per-subscriber │
//! │  Capsule Client Service  │─ state ─►│  channels, drop on full │
//! │  per-capsule locks       │  changes └─────────────────────────┘
//! └──────┬────────────┬──────┘                  ▲      ▲
//!        │            │                         │      │
//!        ▼            ▼              CapsuleStats      │ corrections
//! ┌────────────┐ ┌────────────┐  ┌───────────────┐ ┌──────────────┐
//! │   Docker   │ │    LXC     │  │ Stats Monitor │ │  Reconciler  │
//! │   Driver   │ │   Driver   │  └───────────────┘ └──────────────┘
//! └────────────┘ └────────────┘
//!        │            │
//!        ▼            ▼
//!    docker CLI    lxc-* tools
//! ```
//!
//! # Capsule Operations
//!
//! | Operation | Transitions | Driver calls |
//! |-----------|-------------|--------------|
//! | `register` | none (record created in `Requested`) | none |
//! | `install` / `start` | `→ Installing → Running` or `→ Failed` | `create` (no handle yet), `start` |
//! | `stop` | `→ Stopping → Stopped` or `→ Failed` | `stop` |
//! | `remove` | `→ Removed` | `destroy` |
//! | `inspect` / `stats` | none | `inspect` / `stats` |
//!
//! # Events
//!
//! | Type | Published by |
//! |------|--------------|
//! | `capsule_state_changed` | every applied transition |
//! | `capsule_stats` | stats monitor, one per running capsule per tick |
//! | `job_completed` | message processor, once per terminal job outcome |
//! | `notification` | `notification` job worker |
//!
//! # Modules
//!
//! - [`capsule`]: client service, install worker, reconciler, stats monitor
//! - [`driver`]: backend drivers (Docker, LXC, mock)
//! - [`events`]: event types and the event bus
//! - [`message_processor`]: job queue, notification and email workers, SMTP mailer
//! - [`runtime`]: embeddable runtime wiring everything together
//! - [`config`]: environment-based configuration

#![deny(missing_docs)]

/// Capsule lifecycle coordination and background monitors.
pub mod capsule;

/// Configuration loaded from environment variables.
pub mod config;

/// Backend drivers for capsule runtimes.
pub mod driver;

/// Crate-level error type.
pub mod error;

/// Events and the in-process event bus.
pub mod events;

/// Asynchronous job processing.
pub mod message_processor;

/// Embeddable runtime.
pub mod runtime;

/// Background task handles.
pub mod task;

pub use error::{Error, Result};
pub use runtime::AgentRuntime;
