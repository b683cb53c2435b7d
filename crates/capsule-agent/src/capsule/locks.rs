// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-capsule async locks and in-flight operation tracking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async mutex per capsule id.
///
/// Entries nobody holds or waits on are pruned on acquisition.
#[derive(Default)]
pub(crate) struct CapsuleLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CapsuleLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub(crate) async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Capsule ids with a lifecycle operation currently running.
///
/// An operation marks its capsule for as long as its [`InFlightGuard`] lives,
/// so a dropped or cancelled operation unmarks it too. Overlapping marks on
/// the same id are counted.
#[derive(Default)]
pub(crate) struct InFlight {
    ops: Arc<Mutex<HashMap<String, usize>>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mark `id` until the returned guard is dropped.
    pub(crate) fn enter(&self, id: &str) -> InFlightGuard {
        *lock_counts(&self.ops).entry(id.to_string()).or_insert(0) += 1;
        InFlightGuard {
            ops: self.ops.clone(),
            id: id.to_string(),
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        lock_counts(&self.ops).contains_key(id)
    }
}

/// Keeps a capsule marked in flight.
pub(crate) struct InFlightGuard {
    ops: Arc<Mutex<HashMap<String, usize>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ops = lock_counts(&self.ops);
        if let Some(count) = ops.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                ops.remove(&self.id);
            }
        }
    }
}

fn lock_counts(
    ops: &Mutex<HashMap<String, usize>>,
) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
    ops.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
