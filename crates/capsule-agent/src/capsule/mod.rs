// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capsule lifecycle: the client service, its job worker, and the
//! background loops that keep stored state honest.

pub mod client;
pub mod install_worker;
mod locks;
pub mod reconciler;
pub mod stats_monitor;

pub use client::{ClientError, ClientService};
pub use install_worker::{INSTALL_CAPSULE_JOB_TYPE, InstallCapsulePayload, InstallCapsuleWorker};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use stats_monitor::{MonitorType, StatsMonitor, StatsMonitorConfig, TickSummary};
