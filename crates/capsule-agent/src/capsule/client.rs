// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend-agnostic capsule lifecycle coordinator.
//!
//! Every state change goes through one path: take the capsule's lock, load
//! the record, check the edge, persist, then publish. Driver calls run
//! outside the lock while the capsule sits in `Installing` or `Stopping`,
//! which turns any competing operation into an invalid transition. Those
//! operations are also tracked as in flight, so a capsule left in an
//! in-flight state by a cancelled operation or a crash can be told apart
//! from one that is still being worked on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use capsule_core::persistence::{CapsuleFilter, CapsuleStore};
use capsule_core::{Backend, Capsule, CapsuleState, NewCapsule, StoreError};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::locks::{CapsuleLocks, InFlight};
use crate::driver::{self, CapsuleMetrics, CreateSpec, Driver, DriverError, RuntimeStatus};
use crate::events::{Event, EventBus, EventPayload};

/// Capsule client service errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// No capsule with this id.
    #[error("Capsule not found: {0}")]
    NotFound(String),

    /// A capsule with this id is already registered.
    #[error("Capsule already exists: {0}")]
    AlreadyExists(String),

    /// The requested operation is not legal from the capsule's current state.
    #[error("Invalid transition for capsule {capsule_id}: {from} -> {to}")]
    InvalidTransition {
        /// Capsule id
        capsule_id: String,
        /// Current state
        from: CapsuleState,
        /// Rejected target state
        to: CapsuleState,
    },

    /// No driver is registered for the capsule's backend.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(Backend),

    /// The capsule has no runtime object yet.
    #[error("Capsule {0} has no runtime object")]
    NotProvisioned(String),

    /// The backend driver failed.
    #[error("Driver error for capsule {capsule_id}: {source}")]
    Driver {
        /// Capsule id
        capsule_id: String,
        /// Underlying driver error
        #[source]
        source: DriverError,
    },

    /// The capsule store failed.
    #[error("Capsule store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for client service operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Lifecycle coordinator for capsules on any registered backend.
pub struct ClientService {
    store: Arc<dyn CapsuleStore>,
    bus: EventBus,
    drivers: HashMap<Backend, Arc<dyn Driver>>,
    locks: CapsuleLocks,
    in_flight: InFlight,
    driver_timeout: Duration,
}

/// Edges that bring a capsule in line with its observed runtime status,
/// with the error to record on the last one.
pub(crate) type Correction = (&'static [CapsuleState], Option<String>);

/// Outcome of reconciling one capsule.
#[derive(Debug)]
pub(crate) enum Reconciled {
    /// An operation is running on the capsule; nothing was inspected.
    Busy,
    /// Stored state matches what the runtime reports.
    Consistent,
    /// Stored state was corrected.
    Corrected(Capsule),
}

impl ClientService {
    /// Create a service with no drivers.
    pub fn new(store: Arc<dyn CapsuleStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            drivers: HashMap::new(),
            locks: CapsuleLocks::new(),
            in_flight: InFlight::new(),
            driver_timeout: Duration::from_secs(300),
        }
    }

    /// Register the driver for its backend, replacing any previous one.
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(driver.backend(), driver);
        self
    }

    /// Bound every lifecycle driver call by `timeout`.
    pub fn with_driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }

    /// Backends with a registered driver.
    pub fn backends(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.drivers.keys().copied().collect();
        backends.sort_by_key(|b| b.as_str());
        backends
    }

    /// Record a new capsule in `Requested`. No event is published.
    pub async fn register(&self, request: NewCapsule) -> Result<Capsule> {
        self.driver(request.backend)?;
        let capsule = request.into_capsule();
        let _guard = self.locks.lock(&capsule.id).await;
        if self.store.get(&capsule.id).await?.is_some() {
            return Err(ClientError::AlreadyExists(capsule.id));
        }
        self.store.upsert(&capsule).await?;
        info!(
            capsule_id = %capsule.id,
            name = %capsule.name,
            backend = %capsule.backend,
            "Capsule registered"
        );
        Ok(capsule)
    }

    /// Whether an install, start or stop is currently running on `id`.
    pub fn is_busy(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }

    /// Get a capsule by id.
    pub async fn get(&self, id: &str) -> Result<Capsule> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    /// List capsules matching a filter.
    pub async fn list(&self, filter: &CapsuleFilter) -> Result<Vec<Capsule>> {
        Ok(self.store.list(filter).await?)
    }

    /// Provision and start a capsule: `-> Installing -> Running | Failed`.
    pub async fn install(&self, id: &str) -> Result<Capsule> {
        self.bring_up(id, "install").await
    }

    /// Start a stopped or failed capsule: `-> Installing -> Running | Failed`.
    ///
    /// A capsule whose runtime object exists is only started; otherwise it is
    /// created first.
    pub async fn start(&self, id: &str) -> Result<Capsule> {
        self.bring_up(id, "start").await
    }

    /// Stop a capsule: `-> Stopping -> Stopped | Failed`.
    pub async fn stop(&self, id: &str) -> Result<Capsule> {
        let driver = self.driver_for(id).await?;
        let _in_flight = self.in_flight.enter(id);
        let capsule = self.transition(id, CapsuleState::Stopping, None).await?;

        let result = match capsule.runtime_handle.as_deref() {
            Some(handle) => self.timed(driver.stop(handle)).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                info!(capsule_id = %id, "Capsule stopped");
                self.transition(id, CapsuleState::Stopped, None).await
            }
            Err(e) => Err(self.fail(id, "stop", e).await),
        }
    }

    /// Destroy a capsule's runtime object and mark it `Removed`.
    ///
    /// If the driver cannot destroy the object, the error is recorded on the
    /// capsule, its state is left unchanged and the error is returned.
    pub async fn remove(&self, id: &str) -> Result<Capsule> {
        let driver = self.driver_for(id).await?;
        let _guard = self.locks.lock(id).await;
        let mut capsule = self.get(id).await?;
        check_edge(&capsule, CapsuleState::Removed)?;

        if let Some(handle) = capsule.runtime_handle.clone()
            && let Err(e) = self.timed(driver.destroy(&handle)).await
        {
            warn!(capsule_id = %id, error = %e, "Failed to destroy capsule runtime object");
            capsule.last_error = Some(e.to_string());
            capsule.updated_at = Utc::now();
            self.store.upsert(&capsule).await?;
            return Err(ClientError::Driver {
                capsule_id: id.to_string(),
                source: e,
            });
        }

        capsule.runtime_handle = None;
        let capsule = self
            .apply(capsule, CapsuleState::Removed, None)
            .await?;
        info!(capsule_id = %id, "Capsule removed");
        Ok(capsule)
    }

    /// Observe the runtime status of a capsule.
    pub async fn inspect(&self, id: &str) -> Result<RuntimeStatus> {
        let capsule = self.get(id).await?;
        self.observe(&capsule).await
    }

    async fn observe(&self, capsule: &Capsule) -> Result<RuntimeStatus> {
        let driver = self.driver(capsule.backend)?;
        match capsule.runtime_handle.as_deref() {
            Some(handle) => self
                .timed(driver.inspect(handle))
                .await
                .map_err(|source| ClientError::Driver {
                    capsule_id: capsule.id.clone(),
                    source,
                }),
            None => Ok(RuntimeStatus::Missing),
        }
    }

    /// Sample resource usage of a capsule.
    pub async fn stats(&self, id: &str) -> Result<CapsuleMetrics> {
        let capsule = self.get(id).await?;
        self.stats_for(&capsule).await
    }

    /// Sample resource usage of an already loaded capsule.
    pub(crate) async fn stats_for(&self, capsule: &Capsule) -> Result<CapsuleMetrics> {
        let driver = self.driver(capsule.backend)?;
        let handle = capsule
            .runtime_handle
            .as_deref()
            .ok_or_else(|| ClientError::NotProvisioned(capsule.id.clone()))?;
        self.timed(driver.stats(handle))
            .await
            .map_err(|source| ClientError::Driver {
                capsule_id: capsule.id.clone(),
                source,
            })
    }

    /// Inspect a capsule under its lock and walk the edges `plan` picks
    /// for its current state and observed status.
    ///
    /// Capsules with an operation in flight are left alone. Holding the lock
    /// across the inspection keeps the observation and the correction
    /// consistent with each other.
    pub(crate) async fn reconcile_with<F>(&self, id: &str, plan: F) -> Result<Reconciled>
    where
        F: FnOnce(CapsuleState, RuntimeStatus) -> Option<Correction>,
    {
        let _guard = self.locks.lock(id).await;
        if self.in_flight.contains(id) {
            return Ok(Reconciled::Busy);
        }
        let mut capsule = self.get(id).await?;
        let observed = self.observe(&capsule).await?;
        let Some((steps, error)) = plan(capsule.state, observed) else {
            return Ok(Reconciled::Consistent);
        };

        let mut from = capsule.state;
        for to in steps {
            if !from.can_transition_to(*to) {
                return Err(ClientError::InvalidTransition {
                    capsule_id: id.to_string(),
                    from,
                    to: *to,
                });
            }
            from = *to;
        }

        warn!(
            capsule_id = %id,
            stored = %capsule.state,
            observed = ?observed,
            "Capsule state drifted, correcting"
        );
        for (i, to) in steps.iter().enumerate() {
            let step_error = if i + 1 == steps.len() {
                error.clone()
            } else {
                None
            };
            capsule = self.apply(capsule, *to, step_error).await?;
        }
        Ok(Reconciled::Corrected(capsule))
    }

    async fn bring_up(&self, id: &str, operation: &'static str) -> Result<Capsule> {
        let driver = self.driver_for(id).await?;
        let _in_flight = self.in_flight.enter(id);
        let capsule = self.transition(id, CapsuleState::Installing, None).await?;
        debug!(capsule_id = %id, operation, "Bringing capsule up");

        let handle = match capsule.runtime_handle.clone() {
            Some(handle) => handle,
            None => {
                let spec = CreateSpec {
                    capsule_id: capsule.id.clone(),
                    name: capsule.name.clone(),
                    metadata: capsule.metadata.clone(),
                };
                match self.timed(driver.create(&spec)).await {
                    Ok(handle) => {
                        self.record_handle(id, &handle).await?;
                        handle
                    }
                    Err(e) => return Err(self.fail(id, operation, e).await),
                }
            }
        };

        if let Err(e) = self.timed(driver.start(&handle)).await {
            return Err(self.fail(id, operation, e).await);
        }

        let capsule = self.transition(id, CapsuleState::Running, None).await?;
        info!(capsule_id = %id, backend = %capsule.backend, operation, "Capsule running");
        Ok(capsule)
    }

    /// Move the capsule to `Failed` with the driver error, and return the
    /// error for the caller.
    async fn fail(&self, id: &str, operation: &'static str, err: DriverError) -> ClientError {
        error!(capsule_id = %id, operation, error = %err, "Capsule operation failed");
        if let Err(e) = self
            .transition(id, CapsuleState::Failed, Some(err.to_string()))
            .await
        {
            error!(capsule_id = %id, error = %e, "Failed to record capsule failure");
        }
        ClientError::Driver {
            capsule_id: id.to_string(),
            source: err,
        }
    }

    async fn record_handle(&self, id: &str, handle: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let mut capsule = self.get(id).await?;
        capsule.runtime_handle = Some(handle.to_string());
        self.store.upsert(&capsule).await?;
        Ok(())
    }

    /// Apply one edge under the capsule's lock.
    async fn transition(
        &self,
        id: &str,
        to: CapsuleState,
        error: Option<String>,
    ) -> Result<Capsule> {
        let _guard = self.locks.lock(id).await;
        let capsule = self.get(id).await?;
        self.apply(capsule, to, error).await
    }

    /// Check, persist and publish one edge. The caller holds the lock.
    async fn apply(
        &self,
        mut capsule: Capsule,
        to: CapsuleState,
        error: Option<String>,
    ) -> Result<Capsule> {
        check_edge(&capsule, to)?;
        let from = capsule.state;
        capsule.state = to;
        capsule.last_error = error;
        capsule.updated_at = Utc::now();
        self.store.upsert(&capsule).await?;

        debug!(capsule_id = %capsule.id, from = %from, to = %to, "Capsule transitioned");
        self.bus.publish(Event::new(EventPayload::CapsuleStateChanged {
            capsule_id: capsule.id.clone(),
            name: capsule.name.clone(),
            backend: capsule.backend,
            from,
            to,
            error: capsule.last_error.clone(),
        }));
        Ok(capsule)
    }

    fn driver(&self, backend: Backend) -> Result<&Arc<dyn Driver>> {
        self.drivers
            .get(&backend)
            .ok_or(ClientError::BackendUnavailable(backend))
    }

    async fn driver_for(&self, id: &str) -> Result<Arc<dyn Driver>> {
        let capsule = self.get(id).await?;
        self.driver(capsule.backend).cloned()
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = driver::Result<T>>,
    ) -> driver::Result<T> {
        match tokio::time::timeout(self.driver_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(self.driver_timeout)),
        }
    }
}

fn check_edge(capsule: &Capsule, to: CapsuleState) -> Result<()> {
    if capsule.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(ClientError::InvalidTransition {
            capsule_id: capsule.id.clone(),
            from: capsule.state,
            to,
        })
    }
}
