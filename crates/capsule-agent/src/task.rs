// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handle for a spawned background loop.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;

/// A running background loop that exits when its shutdown handle is notified.
pub struct BackgroundTask {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `run`, which must return once `shutdown` is notified.
    pub(crate) fn spawn<F>(name: &'static str, shutdown: Arc<Notify>, run: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            shutdown,
            handle: tokio::spawn(run),
        }
    }

    /// Task name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop to stop and wait for its current iteration to finish.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.handle.await {
            error!(task = self.name, "Background task panicked: {}", e);
        }
    }
}
