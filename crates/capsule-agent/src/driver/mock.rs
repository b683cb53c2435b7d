// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock driver for testing.
//!
//! Keeps runtime objects in memory and lets tests script failures, delays,
//! out-of-band status changes and metrics without a container runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use capsule_core::Backend;

use super::traits::*;

/// Driver operation, for scripting and call records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// [`Driver::create`]
    Create,
    /// [`Driver::start`]
    Start,
    /// [`Driver::stop`]
    Stop,
    /// [`Driver::destroy`]
    Destroy,
    /// [`Driver::inspect`]
    Inspect,
    /// [`Driver::stats`]
    Stats,
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Operation invoked.
    pub op: MockOp,
    /// Handle it was invoked on (the capsule id for `Create`).
    pub target: String,
}

#[derive(Default)]
struct MockState {
    objects: HashMap<String, RuntimeStatus>,
    failures: HashMap<MockOp, String>,
    one_shot_failures: HashMap<MockOp, VecDeque<String>>,
    metrics: HashMap<String, CapsuleMetrics>,
    stats_delays: HashMap<String, Duration>,
    calls: Vec<MockCall>,
}

/// Mock driver for testing.
pub struct MockDriver {
    backend: Backend,
    state: Mutex<MockState>,
    /// Delay applied to create/start/stop/destroy
    pub operation_delay: Duration,
    /// If true, `probe` reports the runtime as unavailable
    pub unavailable: bool,
}

impl MockDriver {
    /// Create a mock driver serving `backend`.
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: Mutex::new(MockState::default()),
            operation_delay: Duration::ZERO,
            unavailable: false,
        }
    }

    /// Create a mock driver whose lifecycle calls take `delay`.
    pub fn with_delay(backend: Backend, delay: Duration) -> Self {
        Self {
            operation_delay: delay,
            ..Self::new(backend)
        }
    }

    /// Create a mock driver whose runtime is not installed.
    pub fn unavailable(backend: Backend) -> Self {
        Self {
            unavailable: true,
            ..Self::new(backend)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every future `op` call with `message`.
    pub fn fail(&self, op: MockOp, message: impl Into<String>) {
        self.lock().failures.insert(op, message.into());
    }

    /// Fail the next `op` call with `message`.
    pub fn fail_once(&self, op: MockOp, message: impl Into<String>) {
        self.lock()
            .one_shot_failures
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    /// Remove all scripted failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failures.clear();
        state.one_shot_failures.clear();
    }

    /// Change what the runtime reports for `handle`, as if someone had
    /// acted on the container behind the agent's back.
    pub fn set_status(&self, handle: &str, status: RuntimeStatus) {
        let mut state = self.lock();
        if status == RuntimeStatus::Missing {
            state.objects.remove(handle);
        } else {
            state.objects.insert(handle.to_string(), status);
        }
    }

    /// Current status of `handle`.
    pub fn status(&self, handle: &str) -> RuntimeStatus {
        self.lock()
            .objects
            .get(handle)
            .copied()
            .unwrap_or(RuntimeStatus::Missing)
    }

    /// Metrics returned by `stats(handle)`.
    pub fn set_metrics(&self, handle: &str, metrics: CapsuleMetrics) {
        self.lock().metrics.insert(handle.to_string(), metrics);
    }

    /// Make `stats(handle)` take `delay`.
    pub fn set_stats_delay(&self, handle: &str, delay: Duration) {
        self.lock().stats_delays.insert(handle.to_string(), delay);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of calls made for `op`.
    pub fn call_count(&self, op: MockOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Record the call and return a scripted failure, if any.
    fn enter(&self, op: MockOp, target: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall {
            op,
            target: target.to_string(),
        });
        if let Some(message) = state
            .one_shot_failures
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            return Err(DriverError::Other(message));
        }
        if let Some(message) = state.failures.get(&op) {
            return Err(DriverError::Other(message.clone()));
        }
        Ok(())
    }

    async fn pause(&self) {
        if !self.operation_delay.is_zero() {
            tokio::time::sleep(self.operation_delay).await;
        }
    }

    fn require_object(&self, handle: &str) -> Result<()> {
        if self.lock().objects.contains_key(handle) {
            Ok(())
        } else {
            Err(DriverError::NotFound(handle.to_string()))
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn probe(&self) -> Result<()> {
        if self.unavailable {
            return Err(DriverError::BinaryNotFound(format!("mock-{}", self.backend)));
        }
        Ok(())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String> {
        self.pause().await;
        self.enter(MockOp::Create, &spec.capsule_id)?;
        let handle = format!("mock-{}", spec.capsule_id);
        self.lock()
            .objects
            .insert(handle.clone(), RuntimeStatus::Stopped);
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.pause().await;
        self.enter(MockOp::Start, handle)?;
        self.require_object(handle)?;
        self.set_status(handle, RuntimeStatus::Running);
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        self.pause().await;
        self.enter(MockOp::Stop, handle)?;
        self.require_object(handle)?;
        self.set_status(handle, RuntimeStatus::Stopped);
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<()> {
        self.pause().await;
        self.enter(MockOp::Destroy, handle)?;
        let mut state = self.lock();
        state.objects.remove(handle);
        state.metrics.remove(handle);
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> Result<RuntimeStatus> {
        self.enter(MockOp::Inspect, handle)?;
        Ok(self.status(handle))
    }

    async fn stats(&self, handle: &str) -> Result<CapsuleMetrics> {
        let delay = self.lock().stats_delays.get(handle).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enter(MockOp::Stats, handle)?;
        self.require_object(handle)?;
        Ok(self.lock().metrics.get(handle).cloned().unwrap_or(CapsuleMetrics {
            cpu_percent: Some(0.5),
            memory_bytes: Some(16 * 1024 * 1024),
            ..CapsuleMetrics::default()
        }))
    }
}
