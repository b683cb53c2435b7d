// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for capsule-agent.
//!
//! [`AgentRuntime`] wires the event bus, capsule client service, message
//! processor and background monitors together, so the agent can run inside
//! an existing tokio application as well as from the `capsule-agent` binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use capsule_agent::driver::DockerDriver;
//! use capsule_agent::runtime::AgentRuntime;
//! use capsule_core::persistence::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::connect("sqlite:agent.db?mode=rwc").await?);
//!
//!     let runtime = AgentRuntime::builder()
//!         .capsule_store(store.clone())
//!         .message_store(store)
//!         .driver(Arc::new(DockerDriver::new("docker")))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let mut events = runtime.subscribe()?;
//!     // ... consume events, submit jobs ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use capsule_core::NewCapsule;
use capsule_core::persistence::{CapsuleStore, MessageStore};
use tracing::{error, info, warn};

use crate::capsule::{
    ClientService, INSTALL_CAPSULE_JOB_TYPE, InstallCapsulePayload, InstallCapsuleWorker,
    Reconciler, ReconcilerConfig, StatsMonitor, StatsMonitorConfig,
};
use crate::config::Config;
use crate::driver::Driver;
use crate::events::{BusConfig, BusError, EventBus, Subscription};
use crate::message_processor::{
    EMAIL_JOB_TYPE, EmailPayload, EmailWorker, Mailer, MessageProcessor, NOTIFICATION_JOB_TYPE,
    NotificationPayload, NotificationWorker, ProcessorConfig, ProcessorError, Worker,
};
use crate::task::BackgroundTask;

/// Builder for creating an [`AgentRuntime`].
pub struct AgentRuntimeBuilder {
    capsule_store: Option<Arc<dyn CapsuleStore>>,
    message_store: Option<Arc<dyn MessageStore>>,
    drivers: Vec<Arc<dyn Driver>>,
    workers: Vec<(String, Arc<dyn Worker>)>,
    mailer: Option<Arc<dyn Mailer>>,
    bus_config: BusConfig,
    bus_drain_window: Duration,
    processor_config: ProcessorConfig,
    driver_timeout: Duration,
    stats_config: StatsMonitorConfig,
    reconciler_config: ReconcilerConfig,
}

impl Default for AgentRuntimeBuilder {
    fn default() -> Self {
        Self {
            capsule_store: None,
            message_store: None,
            drivers: Vec::new(),
            workers: Vec::new(),
            mailer: None,
            bus_config: BusConfig::default(),
            bus_drain_window: Duration::from_secs(1),
            processor_config: ProcessorConfig::default(),
            driver_timeout: Duration::from_secs(300),
            stats_config: StatsMonitorConfig::default(),
            reconciler_config: ReconcilerConfig::default(),
        }
    }
}

impl AgentRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply tunables from a loaded [`Config`]. Stores and drivers are not
    /// touched.
    pub fn config(mut self, config: &Config) -> Self {
        self.bus_config.capacity = config.event_buffer;
        self.processor_config.workers = config.workers;
        self.processor_config.queue_capacity = config.queue_capacity;
        self.processor_config.default_max_retries = config.job_max_retries;
        self.driver_timeout = config.driver_timeout;
        self.stats_config.interval = config.stats_interval;
        self.reconciler_config.poll_interval = config.reconcile_interval;
        self
    }

    /// Set the capsule store (required).
    pub fn capsule_store(mut self, store: Arc<dyn CapsuleStore>) -> Self {
        self.capsule_store = Some(store);
        self
    }

    /// Set the job store (required).
    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    /// Register a backend driver. At least one is required.
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.push(driver);
        self
    }

    /// Register an additional job worker.
    pub fn worker(mut self, job_type: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        self.workers.push((job_type.into(), worker));
        self
    }

    /// Deliver `email` jobs through `mailer`.
    ///
    /// Without a mailer the `email` job type is not registered and
    /// submissions are rejected.
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Set the per-subscriber event channel capacity.
    ///
    /// Default: 256
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.bus_config.capacity = capacity;
        self
    }

    /// Set how long subscribers get to drain buffered events on shutdown.
    ///
    /// Default: 1 second
    pub fn bus_drain_window(mut self, window: Duration) -> Self {
        self.bus_drain_window = window;
        self
    }

    /// Set the message processor configuration.
    pub fn processor_config(mut self, config: ProcessorConfig) -> Self {
        self.processor_config = config;
        self
    }

    /// Set the upper bound for a single lifecycle driver call.
    ///
    /// Default: 5 minutes
    pub fn driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }

    /// Set the stats monitor configuration.
    pub fn stats_config(mut self, config: StatsMonitorConfig) -> Self {
        self.stats_config = config;
        self
    }

    /// Set the reconciler configuration.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<AgentRuntimeConfig> {
        let capsule_store = self
            .capsule_store
            .ok_or_else(|| anyhow::anyhow!("capsule_store is required"))?;
        let message_store = self
            .message_store
            .ok_or_else(|| anyhow::anyhow!("message_store is required"))?;
        if self.drivers.is_empty() {
            anyhow::bail!("at least one driver is required");
        }
        if self.processor_config.job_timeout <= self.driver_timeout * 2 {
            warn!(
                job_timeout_secs = self.processor_config.job_timeout.as_secs(),
                driver_timeout_secs = self.driver_timeout.as_secs(),
                "Job timeout does not cover a create and a start; installs will be retried while still running"
            );
        }

        Ok(AgentRuntimeConfig {
            capsule_store,
            message_store,
            drivers: self.drivers,
            workers: self.workers,
            mailer: self.mailer,
            bus_config: self.bus_config,
            bus_drain_window: self.bus_drain_window,
            processor_config: self.processor_config,
            driver_timeout: self.driver_timeout,
            stats_config: self.stats_config,
            reconciler_config: self.reconciler_config,
        })
    }
}

/// Configuration for an [`AgentRuntime`].
pub struct AgentRuntimeConfig {
    capsule_store: Arc<dyn CapsuleStore>,
    message_store: Arc<dyn MessageStore>,
    drivers: Vec<Arc<dyn Driver>>,
    workers: Vec<(String, Arc<dyn Worker>)>,
    mailer: Option<Arc<dyn Mailer>>,
    bus_config: BusConfig,
    bus_drain_window: Duration,
    processor_config: ProcessorConfig,
    driver_timeout: Duration,
    stats_config: StatsMonitorConfig,
    reconciler_config: ReconcilerConfig,
}

impl AgentRuntimeConfig {
    /// Start the runtime: bus, job processing and background monitors.
    pub async fn start(self) -> Result<AgentRuntime> {
        let bus = EventBus::new(self.bus_config);
        bus.start();

        let mut client = ClientService::new(self.capsule_store, bus.clone())
            .with_driver_timeout(self.driver_timeout);
        for driver in self.drivers {
            info!(backend = %driver.backend(), "Driver registered");
            client = client.with_driver(driver);
        }
        let client = Arc::new(client);

        // Nothing is in flight yet, so capsules a previous process left in
        // `Installing` or `Stopping` are resolved before jobs are recovered
        match Reconciler::new(client.clone(), self.reconciler_config.clone())
            .reconcile_once()
            .await
        {
            Ok(report) => info!(
                checked = report.checked,
                corrected = report.corrected,
                errors = report.errors,
                "Startup reconciliation finished"
            ),
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }

        let processor = Arc::new(MessageProcessor::new(
            self.processor_config,
            self.message_store,
            bus.clone(),
        ));
        processor.register_worker(
            INSTALL_CAPSULE_JOB_TYPE,
            Arc::new(InstallCapsuleWorker::new(client.clone())),
        )?;
        processor.register_worker(
            NOTIFICATION_JOB_TYPE,
            Arc::new(NotificationWorker::new(bus.clone())),
        )?;
        if let Some(mailer) = self.mailer {
            processor.register_worker(EMAIL_JOB_TYPE, Arc::new(EmailWorker::new(mailer)))?;
        }
        for (job_type, worker) in self.workers {
            processor.register_worker(job_type, worker)?;
        }

        // Recovery enqueues jobs from a previous run, so workers must be in place first
        processor.start().await?;

        let reconciler = client.start_monitoring(self.reconciler_config);
        let stats_monitor = StatsMonitor::start(client.clone(), bus.clone(), self.stats_config);

        info!(
            backends = ?client.backends(),
            job_types = ?processor.stats().job_types,
            "AgentRuntime started"
        );

        Ok(AgentRuntime {
            client,
            processor,
            bus,
            bus_drain_window: self.bus_drain_window,
            stats_monitor,
            reconciler,
        })
    }
}

/// A running agent that can be embedded in an application.
///
/// The runtime manages:
/// - Event bus carrying state changes, stats, job results and notifications
/// - Capsule client service with one driver per backend
/// - Message processor with the `install-capsule` and `notification` workers,
///   plus `email` when a mailer is configured
/// - Stats monitor sampling running capsules
/// - Reconciler correcting drift between stored and observed state
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct AgentRuntime {
    client: Arc<ClientService>,
    processor: Arc<MessageProcessor>,
    bus: EventBus,
    bus_drain_window: Duration,
    stats_monitor: BackgroundTask,
    reconciler: BackgroundTask,
}

impl AgentRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new()
    }

    /// Capsule lifecycle operations.
    pub fn client(&self) -> &Arc<ClientService> {
        &self.client
    }

    /// Job submission and inspection.
    pub fn processor(&self) -> &Arc<MessageProcessor> {
        &self.processor
    }

    /// The event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to all agent events.
    pub fn subscribe(&self) -> std::result::Result<Subscription, BusError> {
        self.bus.subscribe()
    }

    /// Queue an `install-capsule` job and return the capsule id.
    ///
    /// The capsule is registered by the job if it does not exist yet.
    pub async fn request_install(
        &self,
        request: NewCapsule,
    ) -> std::result::Result<String, ProcessorError> {
        let payload = InstallCapsulePayload::from_request(request);
        let capsule_id = payload.capsule_id.clone();
        let value = serde_json::to_value(&payload)
            .map_err(|e| ProcessorError::InvalidPayload(e.to_string()))?;
        self.processor.submit(INSTALL_CAPSULE_JOB_TYPE, value).await?;
        Ok(capsule_id)
    }

    /// Queue a `notification` job and return its job id.
    pub async fn notify(
        &self,
        notification: NotificationPayload,
    ) -> std::result::Result<String, ProcessorError> {
        let value = serde_json::to_value(&notification)
            .map_err(|e| ProcessorError::InvalidPayload(e.to_string()))?;
        self.processor.submit(NOTIFICATION_JOB_TYPE, value).await
    }

    /// Queue an `email` job and return its job id.
    ///
    /// Fails with [`ProcessorError::UnknownJobType`] when the runtime was
    /// built without a mailer.
    pub async fn send_email(
        &self,
        email: EmailPayload,
    ) -> std::result::Result<String, ProcessorError> {
        let value = serde_json::to_value(&email)
            .map_err(|e| ProcessorError::InvalidPayload(e.to_string()))?;
        self.processor.submit(EMAIL_JOB_TYPE, value).await
    }

    /// Check if the background monitors are still running.
    pub fn is_running(&self) -> bool {
        self.stats_monitor.is_running()
            && self.reconciler.is_running()
            && self.processor.stats().running
    }

    /// Gracefully shut down the runtime.
    ///
    /// Monitors stop first so no new events are produced, then in-flight
    /// jobs drain, then subscribers get the bus drain window.
    pub async fn shutdown(self) -> Result<()> {
        info!("AgentRuntime shutting down...");

        self.stats_monitor.stop().await;
        self.reconciler.stop().await;

        let drained = self.processor.stop().await;
        if let Err(e) = &drained {
            error!(error = %e, "Message processor did not drain cleanly");
        }

        self.bus.stop(self.bus_drain_window).await;

        drained?;
        info!("AgentRuntime shutdown complete");
        Ok(())
    }
}
