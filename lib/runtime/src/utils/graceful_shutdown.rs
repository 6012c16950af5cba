// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Counts blocking workers (ingress threads, RPC sessions) that must finish before the
/// process releases memory registrations and closes its transports.
pub struct GracefulShutdownTracker {
    active_workers: AtomicUsize,
    shutdown_complete: Notify,
}

impl std::fmt::Debug for GracefulShutdownTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulShutdownTracker")
            .field("active_workers", &self.active_workers.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for GracefulShutdownTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdownTracker {
    pub fn new() -> Self {
        Self {
            active_workers: AtomicUsize::new(0),
            shutdown_complete: Notify::new(),
        }
    }

    pub fn register_worker(&self) {
        let count = self.active_workers.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Worker registered, total active: {} -> {}", count, count + 1);
    }

    pub fn unregister_worker(&self) {
        let prev = self.active_workers.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            "Worker unregistered, remaining active: {} -> {}",
            prev,
            prev.saturating_sub(1)
        );
        if prev == 1 {
            tracing::info!("Last worker completed, notifying all waiters");
            self.shutdown_complete.notify_waiters();
        }
    }

    /// Get the current count of active workers
    pub fn get_count(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    pub async fn wait_for_completion(&self) {
        loop {
            // Create the waiter BEFORE checking the condition
            let notified = self.shutdown_complete.notified();

            let count = self.active_workers.load(Ordering::SeqCst);
            if count == 0 {
                tracing::debug!("All workers completed");
                break;
            }

            tracing::debug!("Waiting for {} workers to complete", count);
            notified.await;
        }
    }
}

/// Registers a worker on creation and unregisters it on drop, so a panicking worker thread
/// still releases its slot.
pub struct WorkerGuard {
    tracker: std::sync::Arc<GracefulShutdownTracker>,
}

impl WorkerGuard {
    pub fn new(tracker: std::sync::Arc<GracefulShutdownTracker>) -> Self {
        tracker.register_worker();
        Self { tracker }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.tracker.unregister_worker();
    }
}
