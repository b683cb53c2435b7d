// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic resource sampling for running capsules.
//!
//! Every tick lists the capsules stored as `Running`, samples them
//! concurrently and publishes one `CapsuleStats` event per capsule. A slow
//! runtime only costs its own capsule a sample: each call is bounded by
//! `per_call_timeout` and skipped for that tick on expiry.

use std::sync::Arc;
use std::time::Duration;

use capsule_core::persistence::CapsuleFilter;
use capsule_core::{Capsule, CapsuleState};
use futures::future::join_all;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::client::{ClientService, Result};
use crate::driver::CapsuleMetrics;
use crate::events::{Event, EventBus, EventPayload};
use crate::task::BackgroundTask;

/// What a stats monitor samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorType {
    /// Per-capsule resource usage.
    #[default]
    Capsule,
}

/// Configuration for the stats monitor.
#[derive(Debug, Clone)]
pub struct StatsMonitorConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// What to sample.
    pub monitor_type: MonitorType,
    /// Upper bound for a single capsule's sample.
    pub per_call_timeout: Duration,
}

impl Default for StatsMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            monitor_type: MonitorType::Capsule,
            per_call_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// `CapsuleStats` events published.
    pub published: usize,
    /// Samples skipped after `per_call_timeout`.
    pub timed_out: usize,
    /// Samples the driver failed to produce.
    pub failed: usize,
}

/// Background worker that publishes capsule resource usage.
pub struct StatsMonitor {
    client: Arc<ClientService>,
    bus: EventBus,
    config: StatsMonitorConfig,
    shutdown: Arc<Notify>,
}

impl StatsMonitor {
    /// Create a new stats monitor.
    pub fn new(client: Arc<ClientService>, bus: EventBus, config: StatsMonitorConfig) -> Self {
        Self {
            client,
            bus,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn a monitor loop. Stop it with [`BackgroundTask::stop`], which
    /// lets an in-flight tick finish.
    pub fn start(
        client: Arc<ClientService>,
        bus: EventBus,
        config: StatsMonitorConfig,
    ) -> BackgroundTask {
        let monitor = Self::new(client, bus, config);
        let shutdown = monitor.shutdown_handle();
        BackgroundTask::spawn("stats-monitor", shutdown, async move {
            monitor.run().await;
        })
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sampling loop until shutdown is signaled.
    pub async fn run(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            monitor_type = ?self.config.monitor_type,
            "Stats monitor started"
        );

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Stats monitor received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    match self.collect_once().await {
                        Ok(summary) => debug!(
                            published = summary.published,
                            timed_out = summary.timed_out,
                            failed = summary.failed,
                            "Stats tick finished"
                        ),
                        Err(e) => error!(error = %e, "Failed to list capsules for stats"),
                    }
                }
            }
        }

        info!("Stats monitor stopped");
    }

    /// Sample every running capsule once.
    pub async fn collect_once(&self) -> Result<TickSummary> {
        match self.config.monitor_type {
            MonitorType::Capsule => self.collect_capsules().await,
        }
    }

    async fn collect_capsules(&self) -> Result<TickSummary> {
        let capsules = self
            .client
            .list(&CapsuleFilter::in_state(CapsuleState::Running))
            .await?;

        let samples = join_all(capsules.iter().map(|capsule| async move {
            let sample =
                tokio::time::timeout(self.config.per_call_timeout, self.client.stats_for(capsule))
                    .await;
            (capsule, sample)
        }))
        .await;

        let mut summary = TickSummary::default();
        for (capsule, sample) in samples {
            match sample {
                Ok(Ok(metrics)) => {
                    self.publish(capsule, metrics);
                    summary.published += 1;
                }
                Ok(Err(e)) => {
                    warn!(capsule_id = %capsule.id, error = %e, "Failed to sample capsule");
                    summary.failed += 1;
                }
                Err(_) => {
                    warn!(
                        capsule_id = %capsule.id,
                        timeout_ms = self.config.per_call_timeout.as_millis() as u64,
                        "Capsule sample timed out, skipped this tick"
                    );
                    summary.timed_out += 1;
                }
            }
        }
        Ok(summary)
    }

    fn publish(&self, capsule: &Capsule, metrics: CapsuleMetrics) {
        self.bus.publish(Event::new(EventPayload::CapsuleStats {
            capsule_id: capsule.id.clone(),
            name: capsule.name.clone(),
            backend: capsule.backend,
            metrics,
        }));
    }
}
