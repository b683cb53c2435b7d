// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for capsule-agent integration tests.
//!
//! Provides a [`TestContext`] wiring a client service to a mock driver and an
//! in-memory store, plus scripted job workers and event helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use capsule_core::persistence::{MemoryCapsuleStore, MemoryMessageStore};
use capsule_core::{Backend, CapsuleState, Job};

use capsule_agent::capsule::ClientService;
use capsule_agent::driver::MockDriver;
use capsule_agent::events::{BusConfig, Event, EventBus, EventPayload, Subscription};
use capsule_agent::message_processor::{
    EmailPayload, JobError, MailError, Mailer, MessageProcessor, ProcessorConfig, Worker,
};

/// Client service over a mock Docker driver and in-memory store.
pub struct TestContext {
    pub bus: EventBus,
    pub store: Arc<MemoryCapsuleStore>,
    pub driver: Arc<MockDriver>,
    pub client: Arc<ClientService>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_driver(MockDriver::new(Backend::Docker))
    }

    pub fn with_driver(driver: MockDriver) -> Self {
        let bus = EventBus::new(BusConfig::default());
        bus.start();
        let store = Arc::new(MemoryCapsuleStore::new());
        let driver = Arc::new(driver);
        let client = Arc::new(
            ClientService::new(store.clone(), bus.clone()).with_driver(driver.clone()),
        );
        Self {
            bus,
            store,
            driver,
            client,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe().expect("bus is running")
    }
}

/// Processor over an in-memory message store with fast retries.
pub fn processor(config: ProcessorConfig) -> (Arc<MessageProcessor>, Arc<MemoryMessageStore>, EventBus) {
    let bus = EventBus::new(BusConfig::default());
    bus.start();
    let store = Arc::new(MemoryMessageStore::new());
    let processor = Arc::new(MessageProcessor::new(config, store.clone(), bus.clone()));
    (processor, store, bus)
}

/// Processor settings suited to tests: short backoff and drain.
pub fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        workers: 2,
        queue_capacity: 16,
        default_max_retries: 3,
        job_timeout: Duration::from_secs(5),
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        drain_timeout: Duration::from_secs(2),
    }
}

/// Everything currently buffered for `sub`.
pub fn drain(sub: &mut Subscription) -> Vec<Arc<Event>> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

/// Next event, or `None` after `wait`.
pub async fn next_event(sub: &mut Subscription, wait: Duration) -> Option<Arc<Event>> {
    tokio::time::timeout(wait, sub.recv()).await.ok().flatten()
}

/// Wait for the next event matching `pred`, skipping others.
pub async fn wait_for_event<F>(sub: &mut Subscription, wait: Duration, pred: F) -> Option<Arc<Event>>
where
    F: Fn(&EventPayload) -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let event = next_event(sub, remaining).await?;
        if pred(&event.payload) {
            return Some(event);
        }
    }
}

/// `(capsule_id, from, to)` of every state change in `events`.
pub fn state_changes(events: &[Arc<Event>]) -> Vec<(String, CapsuleState, CapsuleState)> {
    events
        .iter()
        .filter_map(|event| match &event.payload {
            EventPayload::CapsuleStateChanged {
                capsule_id,
                from,
                to,
                ..
            } => Some((capsule_id.clone(), *from, *to)),
            _ => None,
        })
        .collect()
}

/// Poll `check` until it returns true or `wait` elapses.
pub async fn eventually<F>(wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// Worker that records the order of job ids it processed.
#[derive(Default)]
pub struct RecordingWorker {
    pub seen: Mutex<Vec<String>>,
    pub delay: Duration,
}

impl RecordingWorker {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().unwrap().push(job.id.clone());
        Ok(())
    }
}

/// Worker that fails its first `failures` attempts.
pub struct FlakyWorker {
    pub attempts: AtomicU32,
    pub failures: u32,
    pub retryable: bool,
}

impl FlakyWorker {
    pub fn failing(failures: u32) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            failures,
            retryable: true,
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    pub fn permanent() -> Self {
        Self {
            retryable: false,
            ..Self::always_failing()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for FlakyWorker {
    async fn process(&self, _job: &Job) -> Result<(), JobError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            if self.retryable {
                return Err(JobError::retryable(format!("attempt {attempt} failed")));
            }
            return Err(JobError::permanent("bad input"));
        }
        Ok(())
    }
}

/// Worker that panics on every attempt.
pub struct PanickingWorker;

#[async_trait]
impl Worker for PanickingWorker {
    async fn process(&self, _job: &Job) -> Result<(), JobError> {
        panic!("worker exploded");
    }
}

/// Worker that blocks for `delay` on every attempt.
pub struct SlowWorker {
    pub delay: Duration,
}

#[async_trait]
impl Worker for SlowWorker {
    async fn process(&self, _job: &Job) -> Result<(), JobError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Mailer that fails with scripted errors, then records what it sends.
#[derive(Default)]
pub struct ScriptedMailer {
    pub failures: Mutex<VecDeque<MailError>>,
    pub sent: Mutex<Vec<EmailPayload>>,
    pub attempts: AtomicU32,
}

impl ScriptedMailer {
    pub fn failing_with(failures: impl IntoIterator<Item = MailError>) -> Self {
        Self {
            failures: Mutex::new(failures.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<EmailPayload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, email: &EmailPayload) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}
