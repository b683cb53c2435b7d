// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event bus for fanning events out to live subscribers.
//!
//! Each subscriber owns a bounded channel. Publishing never waits: if a
//! subscriber's channel is full the event is dropped for that subscriber
//! only and its drop counter is bumped (at-most-once, latest-wins). A
//! subscriber that stays full for `max_consecutive_drops` publishes in a
//! row is evicted; a subscriber whose receiver is gone is removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::Event;

/// Default number of consecutive dropped events before a subscriber is evicted.
pub const DEFAULT_MAX_CONSECUTIVE_DROPS: u32 = 1024;

/// Event bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has not been started or has been stopped.
    #[error("Event bus is not running")]
    NotRunning,
}

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber channel capacity
    pub capacity: usize,
    /// Evict a subscriber after this many drops in a row
    pub max_consecutive_drops: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_consecutive_drops: DEFAULT_MAX_CONSECUTIVE_DROPS,
        }
    }
}

struct Subscriber {
    sender: mpsc::Sender<Arc<Event>>,
    dropped: Arc<AtomicU64>,
    consecutive_drops: AtomicU32,
}

struct Inner {
    config: BusConfig,
    running: AtomicBool,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
}

/// Process-wide publish/subscribe hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Create a stopped bus.
    pub fn new(mut config: BusConfig) -> Self {
        config.capacity = config.capacity.max(1);
        config.max_consecutive_drops = config.max_consecutive_drops.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                running: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Bus configuration.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Accept subscriptions and deliver published events.
    pub fn start(&self) {
        if !self.inner.running.swap(true, Ordering::SeqCst) {
            info!(
                capacity = self.inner.config.capacity,
                "Event bus started"
            );
        }
    }

    /// Whether the bus is between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.read_subscribers().len()
    }

    /// Attach a new subscriber.
    pub fn subscribe(&self) -> Result<Subscription, BusError> {
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }
        let (sender, receiver) = mpsc::channel(self.inner.config.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));

        self.write_subscribers().insert(
            id,
            Subscriber {
                sender,
                dropped: dropped.clone(),
                consecutive_drops: AtomicU32::new(0),
            },
        );
        debug!(subscriber_id = id, "Subscriber attached");

        Ok(Subscription {
            id,
            receiver,
            dropped,
        })
    }

    /// Detach a subscriber and close its channel.
    ///
    /// Returns false if the id is not attached (already removed or evicted).
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.write_subscribers().remove(&id).is_some();
        if removed {
            debug!(subscriber_id = id, "Subscriber detached");
        }
        removed
    }

    /// Deliver an event to every live subscriber without waiting on any of them.
    ///
    /// Returns the number of subscribers the event was queued for. Publishing
    /// on a bus that is not running delivers nothing.
    pub fn publish(&self, event: Event) -> usize {
        if !self.is_running() {
            trace!(event_type = event.event_type(), "Event bus not running, event discarded");
            return 0;
        }

        let event = Arc::new(event);
        let max_drops = self.inner.config.max_consecutive_drops;
        let mut delivered = 0;
        let mut closed = Vec::new();
        let mut evicted = Vec::new();

        {
            let subscribers = self.read_subscribers();
            for (id, sub) in subscribers.iter() {
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => {
                        sub.consecutive_drops.store(0, Ordering::Relaxed);
                        delivered += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let total = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        let in_a_row = sub.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        trace!(
                            subscriber_id = id,
                            event_type = event.event_type(),
                            dropped_total = total,
                            "Subscriber channel full, event dropped"
                        );
                        if in_a_row >= max_drops {
                            evicted.push((*id, total));
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() || !evicted.is_empty() {
            let mut subscribers = self.write_subscribers();
            for id in &closed {
                subscribers.remove(id);
                debug!(subscriber_id = id, "Subscriber receiver closed, removed");
            }
            for (id, dropped) in &evicted {
                subscribers.remove(id);
                warn!(
                    subscriber_id = id,
                    dropped_total = dropped,
                    max_consecutive_drops = max_drops,
                    "Subscriber evicted after too many consecutive drops"
                );
            }
        }

        delivered
    }

    /// Stop the bus.
    ///
    /// New publishes are discarded immediately. Subscribers get up to
    /// `drain_window` to empty their channels, then every channel is closed
    /// so receive loops end after the buffered events.
    pub async fn stop(&self, drain_window: Duration) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let deadline = tokio::time::Instant::now() + drain_window;
        while tokio::time::Instant::now() < deadline && !self.all_drained() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining: Vec<_> = self.write_subscribers().drain().collect();
        let undrained = remaining
            .iter()
            .filter(|(_, s)| s.sender.capacity() < s.sender.max_capacity())
            .count();
        info!(
            subscribers = remaining.len(),
            undrained,
            "Event bus stopped"
        );
    }

    fn all_drained(&self) -> bool {
        self.read_subscribers()
            .values()
            .all(|s| s.sender.is_closed() || s.sender.capacity() == s.sender.max_capacity())
    }

    fn read_subscribers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Subscriber>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Subscriber>> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A live consumer of the bus.
///
/// Dropping the subscription detaches it on the next publish.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Arc<Event>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Subscriber id, for [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event. Returns `None` once the subscriber has been
    /// detached (unsubscribed, evicted or bus stopped) and its buffer is empty.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    /// Receive a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.try_recv().ok()
    }

    /// Events dropped for this subscriber because its channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
