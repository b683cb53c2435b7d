// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background loop that corrects stored capsule state from driver truth.
//!
//! Containers can be stopped, started or deleted behind the agent's back
//! (`docker stop`, host reboot, `lxc-destroy`), and an operation can be cut
//! short by a crash or a cancelled job, leaving its capsule in `Installing`
//! or `Stopping`. On each poll every capsule that has no operation in flight
//! is inspected under its lock, and drift is corrected by walking legal
//! edges through the client service, so corrections publish the same
//! `CapsuleStateChanged` events as explicit operations:
//!
//! | Stored | Observed | Correction |
//! |--------|----------|------------|
//! | Running | stopped | Stopping → Stopped |
//! | Running | missing | Stopping → Failed |
//! | Stopped, Failed | running | Installing → Running |
//! | Installing | running | Running |
//! | Installing | stopped, missing | Failed |
//! | Stopping | stopped | Stopped |
//! | Stopping | running, missing | Failed |
//!
//! Capsules in `Requested` or `Removed` are skipped, as is any capsule whose
//! runtime reports an unknown status.

use std::sync::Arc;
use std::time::Duration;

use capsule_core::CapsuleState;
use capsule_core::persistence::CapsuleFilter;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::client::{ClientService, Correction, Reconciled, Result};
use crate::driver::RuntimeStatus;
use crate::task::BackgroundTask;

/// Recorded when a running capsule's runtime object is gone.
const DISAPPEARED: &str = "runtime object disappeared";
/// Recorded when an install or start never finished.
const INSTALL_INTERRUPTED: &str = "install interrupted before completion";
/// Recorded when a stop never finished.
const STOP_INTERRUPTED: &str = "stop interrupted before completion";

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to compare stored state with the runtimes.
    pub poll_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Capsules inspected.
    pub checked: usize,
    /// Capsules whose stored state was corrected.
    pub corrected: usize,
    /// Capsules that could not be inspected or corrected.
    pub errors: usize,
}

/// Background worker that reconciles capsule state.
pub struct Reconciler {
    client: Arc<ClientService>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(client: Arc<ClientService>, config: ReconcilerConfig) -> Self {
        Self {
            client,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signaled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Capsule reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Capsule reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.reconcile_once().await {
                        Ok(report) if report.corrected > 0 || report.errors > 0 => {
                            info!(
                                checked = report.checked,
                                corrected = report.corrected,
                                errors = report.errors,
                                "Reconciliation pass finished"
                            );
                        }
                        Ok(report) => debug!(checked = report.checked, "No capsule drift"),
                        Err(e) => error!(error = %e, "Failed to list capsules for reconciliation"),
                    }
                }
            }
        }

        info!("Capsule reconciler stopped");
    }

    /// Inspect every capsule without an operation in flight once and
    /// correct drift.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let capsules = self
            .client
            .list(&CapsuleFilter {
                states: Some(vec![
                    CapsuleState::Installing,
                    CapsuleState::Running,
                    CapsuleState::Stopping,
                    CapsuleState::Stopped,
                    CapsuleState::Failed,
                ]),
                ..CapsuleFilter::default()
            })
            .await?;

        let mut report = ReconcileReport::default();
        for capsule in capsules {
            match self.client.reconcile_with(&capsule.id, correction).await {
                Ok(Reconciled::Busy) => {
                    debug!(capsule_id = %capsule.id, "Capsule operation in flight, skipped");
                }
                Ok(Reconciled::Consistent) => report.checked += 1,
                Ok(Reconciled::Corrected(corrected)) => {
                    info!(
                        capsule_id = %corrected.id,
                        state = %corrected.state,
                        "Capsule state corrected"
                    );
                    report.checked += 1;
                    report.corrected += 1;
                }
                Err(e) => {
                    warn!(capsule_id = %capsule.id, error = %e, "Failed to reconcile capsule");
                    report.checked += 1;
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Edges that bring `stored` in line with `observed`, and the error to record.
fn correction(stored: CapsuleState, observed: RuntimeStatus) -> Option<Correction> {
    use CapsuleState::*;
    match (stored, observed) {
        (Running, RuntimeStatus::Stopped) => Some((&[Stopping, Stopped], None)),
        (Running, RuntimeStatus::Missing) => {
            Some((&[Stopping, Failed], Some(DISAPPEARED.to_string())))
        }
        (Stopped | Failed, RuntimeStatus::Running) => Some((&[Installing, Running], None)),
        (Installing, RuntimeStatus::Running) => Some((&[Running], None)),
        (Installing, RuntimeStatus::Stopped | RuntimeStatus::Missing) => {
            Some((&[Failed], Some(INSTALL_INTERRUPTED.to_string())))
        }
        (Stopping, RuntimeStatus::Stopped) => Some((&[Stopped], None)),
        (Stopping, RuntimeStatus::Running | RuntimeStatus::Missing) => {
            Some((&[Failed], Some(STOP_INTERRUPTED.to_string())))
        }
        _ => None,
    }
}

impl ClientService {
    /// Launch the reconciliation loop for this service.
    pub fn start_monitoring(self: &Arc<Self>, config: ReconcilerConfig) -> BackgroundTask {
        let reconciler = Reconciler::new(self.clone(), config);
        let shutdown = reconciler.shutdown_handle();
        BackgroundTask::spawn("reconciler", shutdown, async move {
            reconciler.run().await;
        })
    }
}
