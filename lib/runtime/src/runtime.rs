// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The [Runtime] owns the tokio thread pool and the process-wide [`CancellationToken`].
//!
//! Every long-running loop in the fabric (ingress receive loop, RPC accept loop) observes a
//! child of the primary token. Shutdown is signal-driven: SIGINT or SIGTERM cancels the
//! token, after which the owner of each subsystem stops accepting work, releases memory
//! registrations and closes its transports, in that order.

use crate::utils::GracefulShutdownTracker;

use futures::Future;
use std::sync::Arc;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Types of Tokio runtimes that can back a [Runtime].
#[derive(Clone, Debug)]
enum RuntimeType {
    Shared(Arc<tokio::runtime::Runtime>),
    External(tokio::runtime::Handle),
}

impl RuntimeType {
    /// Get [`tokio::runtime::Handle`] to runtime
    fn handle(&self) -> tokio::runtime::Handle {
        match self {
            RuntimeType::External(rt) => rt.clone(),
            RuntimeType::Shared(rt) => rt.handle().clone(),
        }
    }
}

/// Local [Runtime] which provides access to shared resources local to the physical node.
#[derive(Debug, Clone)]
pub struct Runtime {
    id: Arc<String>,
    primary: RuntimeType,
    cancellation_token: CancellationToken,
    graceful_shutdown_tracker: Arc<GracefulShutdownTracker>,
}

impl Runtime {
    fn new(runtime: RuntimeType) -> Runtime {
        Runtime {
            id: Arc::new(uuid::Uuid::new_v4().to_string()),
            primary: runtime,
            cancellation_token: CancellationToken::new(),
            graceful_shutdown_tracker: Arc::new(GracefulShutdownTracker::new()),
        }
    }

    /// Build a multi-threaded tokio runtime owned by this [`Runtime`].
    pub fn from_settings() -> anyhow::Result<Runtime> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("aitherion-rt")
            .build()?;
        Ok(Runtime::new(RuntimeType::Shared(Arc::new(runtime))))
    }

    /// Wrap the tokio runtime the caller is already running on.
    pub fn from_current() -> anyhow::Result<Runtime> {
        Ok(Runtime::new(RuntimeType::External(
            tokio::runtime::Handle::try_current()?,
        )))
    }

    /// Returns the unique identifier for the [`Runtime`]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a [`tokio::runtime::Handle`] for the application thread pool
    pub fn primary(&self) -> tokio::runtime::Handle {
        self.primary.handle()
    }

    /// Access the primary [`CancellationToken`] for the [`Runtime`]
    pub fn primary_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Creates a child [`CancellationToken`] tied to the life-cycle of the [`Runtime`]
    pub fn child_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Tracker for blocking workers that must finish before transports are closed
    pub fn graceful_shutdown_tracker(&self) -> Arc<GracefulShutdownTracker> {
        self.graceful_shutdown_tracker.clone()
    }

    /// Cancel the primary token. Every loop holding a child token stops accepting work.
    pub fn shutdown(&self) {
        tracing::info!("Runtime shutdown initiated");
        self.cancellation_token.cancel();
    }

    /// Wait for tracked workers to finish, bounded by `timeout`. Returns `false` on timeout.
    pub async fn wait_for_workers(&self, timeout: Duration) -> bool {
        let count = self.graceful_shutdown_tracker.get_count();
        tracing::info!("Waiting for {} active workers to finish", count);
        match tokio::time::timeout(timeout, self.graceful_shutdown_tracker.wait_for_completion())
            .await
        {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "Timed out after {:?} waiting for {} workers",
                    timeout,
                    self.graceful_shutdown_tracker.get_count()
                );
                false
            }
        }
    }

    /// Spawn the task that turns SIGINT/SIGTERM into [`Runtime::shutdown`].
    pub fn install_signal_handler(&self) {
        let token = self.primary_token();
        self.primary().spawn(async move {
            tokio::select! {
                result = shutdown_signal() => {
                    match result {
                        Ok(signal) => tracing::info!("Received {}, shutting down", signal),
                        Err(e) => tracing::error!("Failed to listen for shutdown signals: {}", e),
                    }
                    tracing::info!("Runtime shutdown initiated");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Run `f` to completion on the primary runtime with the signal handler installed.
    pub fn execute<F, Fut>(&self, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(Runtime) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let handle = self.primary();
        let runtime = self.clone();
        handle.block_on(async move {
            runtime.install_signal_handler();
            f(runtime).await
        })
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl-C")
}
