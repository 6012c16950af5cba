// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ingress Dispatcher
//!
//! One receive loop per socket copies each datagram into a pooled buffer and pushes it onto a
//! bounded [`RingBuffer`]. The loop never waits on downstream work: when the ring is full the
//! datagram is dropped and counted. A fixed set of named worker threads pops buffers, decodes
//! and verifies the frame, hands the command to a [`CommandHandler`] and lets the buffer fall
//! back into the pool. Workers share no ordering.

use crate::codec::{self, CodecErrorKind, MemoryOpCommand};
use crate::ring::{PushError, RingBuffer};
use crate::routing::{RouteError, RouteOutcome, Router};
use crate::transport::{TransferError, Transport};

use aitherion_runtime::CancellationToken;
use aitherion_runtime::utils::graceful_shutdown::WorkerGuard;
use aitherion_runtime::utils::{GracefulShutdownTracker, Pool, PoolItem};
use anyhow::Context;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tokio::net::UdpSocket;

type Datagram = PoolItem<Vec<u8>>;

/// Consumer of verified commands
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, cmd: MemoryOpCommand) -> Result<RouteOutcome, RouteError>;
}

impl CommandHandler for Router {
    fn handle(&self, cmd: MemoryOpCommand) -> Result<RouteOutcome, RouteError> {
        self.route(&cmd)
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Largest datagram read from the socket; longer ones are truncated and fail decode
    pub max_datagram_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: crate::ring::DEFAULT_CAPACITY,
            max_datagram_size: 4096 + codec::HEADER_LEN,
        }
    }
}

impl From<&aitherion_runtime::FabricConfig> for DispatcherConfig {
    fn from(config: &aitherion_runtime::FabricConfig) -> Self {
        Self {
            workers: config.ingress_workers,
            queue_capacity: config.queue_capacity,
            max_datagram_size: config.max_datagram_size,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    received: AtomicU64,
    dropped_full: AtomicU64,
    malformed: AtomicU64,
    checksum_failed: AtomicU64,
    routed: AtomicU64,
    route_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub dropped_full: u64,
    pub malformed: u64,
    pub checksum_failed: u64,
    pub routed: u64,
    pub route_failed: u64,
}

impl DispatchStatsSnapshot {
    /// Datagrams that reached a final state
    pub fn settled(&self) -> u64 {
        self.dropped_full + self.malformed + self.checksum_failed + self.routed + self.route_failed
    }
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            checksum_failed: self.checksum_failed.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            route_failed: self.route_failed.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct Dispatcher {
    ring: Arc<RingBuffer<Datagram>>,
    pool: Pool<Vec<u8>>,
    stats: Arc<DispatchStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_datagram_size: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ring", &self.ring)
            .field("workers", &self.workers.lock().len())
            .field("stats", &self.stats.snapshot())
            .field("idle_buffers", &self.pool.idle())
            .finish()
    }
}

impl Dispatcher {
    /// Spawn the worker threads. Each worker holds a slot in `tracker` until it exits.
    pub fn start(
        config: DispatcherConfig,
        handler: Arc<dyn CommandHandler>,
        tracker: Arc<GracefulShutdownTracker>,
    ) -> anyhow::Result<Self> {
        let ring = Arc::new(RingBuffer::new(config.queue_capacity));
        let max_datagram_size = config.max_datagram_size;
        // one buffer per queue slot plus one in flight per worker
        let pool = Pool::new(config.queue_capacity + config.workers, move || {
            Vec::with_capacity(max_datagram_size)
        });
        let stats = Arc::new(DispatchStats::default());

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let ring = ring.clone();
            let handler = handler.clone();
            let stats = stats.clone();
            let guard = WorkerGuard::new(tracker.clone());
            let handle = std::thread::Builder::new()
                .name(format!("ingress-worker-{id}"))
                .spawn(move || {
                    let _guard = guard;
                    worker_loop(id, &ring, handler.as_ref(), &stats);
                })
                .with_context(|| format!("failed to spawn ingress worker {id}"))?;
            workers.push(handle);
        }

        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            max_datagram_size,
            "ingress dispatcher started"
        );

        Ok(Self {
            ring,
            pool,
            stats,
            workers: Mutex::new(workers),
            max_datagram_size,
        })
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.ring.len()
    }

    /// Empty buffer from the pool
    pub fn buffer(&self) -> Datagram {
        self.pool.acquire()
    }

    /// Queue a received datagram. Returns `false` when it was dropped.
    pub fn submit(&self, datagram: Datagram) -> bool {
        bump(&self.stats.received);
        match self.ring.try_push(datagram) {
            Ok(()) => true,
            Err(PushError::Full(datagram)) => {
                bump(&self.stats.dropped_full);
                tracing::warn!(
                    bytes = datagram.len(),
                    capacity = self.ring.capacity(),
                    "ingress queue full, dropping datagram"
                );
                false
            }
            Err(PushError::Closed(_)) => {
                tracing::debug!("ingress queue closed, dropping datagram");
                false
            }
        }
    }

    /// Copy `data` into a pooled buffer and queue it
    pub fn submit_bytes(&self, data: &[u8]) -> bool {
        let mut buf = self.buffer();
        buf.extend_from_slice(data);
        self.submit(buf)
    }

    /// Receive loop over a UDP socket; returns when `token` is cancelled
    pub async fn run_udp(&self, socket: UdpSocket, token: CancellationToken) -> anyhow::Result<()> {
        let local = socket.local_addr()?;
        tracing::info!(%local, "ingress receive loop started");
        loop {
            let mut buf = self.buffer();
            buf.resize(self.max_datagram_size, 0);

            tokio::select! {
                _ = token.cancelled() => break,
                result = socket.recv_from(&mut buf[..]) => match result {
                    Ok((len, from)) => {
                        buf.truncate(len);
                        tracing::trace!(%from, bytes = len, "datagram received");
                        self.submit(buf);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "datagram receive failed");
                    }
                }
            }
        }
        tracing::info!(%local, "ingress receive loop stopped");
        Ok(())
    }

    /// Receive loop over any [`Transport`]; returns when `token` is cancelled or the transport
    /// closes
    pub async fn run_transport(
        &self,
        transport: Arc<dyn Transport>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let mut buf = self.buffer();
            tokio::select! {
                _ = token.cancelled() => break,
                result = transport.receive_into(&mut buf) => match result {
                    Ok(()) => {
                        self.submit(buf);
                    }
                    Err(TransferError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "transport receive failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop accepting datagrams, let the workers drain the queue and join them
    pub fn shutdown(&self) {
        self.ring.close();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let name = worker.thread().name().unwrap_or("ingress-worker").to_string();
            if worker.join().is_err() {
                tracing::error!(worker = %name, "ingress worker panicked");
            }
        }
        tracing::info!(
            stats = ?self.stats.snapshot(),
            buffers = self.pool.created(),
            "ingress dispatcher stopped"
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.ring.close();
    }
}

fn worker_loop(
    id: usize,
    ring: &RingBuffer<Datagram>,
    handler: &dyn CommandHandler,
    stats: &DispatchStats,
) {
    tracing::debug!(worker = id, "ingress worker started");
    while let Some(datagram) = ring.pop() {
        process(&datagram, handler, stats);
        // buffer returns to the pool here
    }
    tracing::debug!(worker = id, "ingress worker exiting");
}

fn process(datagram: &[u8], handler: &dyn CommandHandler, stats: &DispatchStats) {
    let cmd = match codec::decode_framed(datagram) {
        Ok(cmd) => cmd,
        Err(e) => {
            match e.kind() {
                CodecErrorKind::Checksum => bump(&stats.checksum_failed),
                CodecErrorKind::Format | CodecErrorKind::SizeMismatch => bump(&stats.malformed),
            }
            tracing::warn!(bytes = datagram.len(), error = %e, "dropping datagram");
            return;
        }
    };

    let dst = cmd.destination();
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(cmd))) {
        Ok(Ok(outcome)) => {
            bump(&stats.routed);
            tracing::trace!(%dst, %outcome, "command handled");
        }
        Ok(Err(e)) => {
            bump(&stats.route_failed);
            tracing::warn!(%dst, error = %e, "command failed");
        }
        Err(_) => {
            bump(&stats.route_failed);
            tracing::error!(%dst, "command handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_framed;
    use crate::topology::NodeId;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<MemoryOpCommand>>,
    }

    impl CommandHandler for Recorder {
        fn handle(&self, cmd: MemoryOpCommand) -> Result<RouteOutcome, RouteError> {
            if cmd.destination().raw() == 0xBAD {
                return Err(RouteError::RouteNotFound(NodeId(9)));
            }
            if cmd.destination().raw() == 0xDEAD {
                panic!("handler bug");
            }
            self.seen.lock().push(cmd);
            Ok(RouteOutcome::Local { node: NodeId(0) })
        }
    }

    fn start(handler: Arc<Recorder>, workers: usize, capacity: usize) -> Dispatcher {
        Dispatcher::start(
            DispatcherConfig {
                workers,
                queue_capacity: capacity,
                max_datagram_size: 256,
            },
            handler,
            Arc::new(GracefulShutdownTracker::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_invalid_and_failing_datagrams() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = start(recorder.clone(), 2, 16);

        let good = MemoryOpCommand::copy(0x10u64, b"ok".to_vec());
        let mut corrupt = encode_framed(&MemoryOpCommand::copy(0x20u64, b"xx".to_vec()))
            .unwrap()
            .to_vec();
        corrupt[codec::HEADER_LEN] ^= 0x80;

        assert!(dispatcher.submit_bytes(&encode_framed(&good).unwrap()));
        assert!(dispatcher.submit_bytes(&corrupt));
        assert!(dispatcher.submit_bytes(&[1, 2, 3]));
        assert!(dispatcher.submit_bytes(
            &encode_framed(&MemoryOpCommand::copy(0xBADu64, vec![1])).unwrap()
        ));
        assert!(dispatcher.submit_bytes(
            &encode_framed(&MemoryOpCommand::copy(0xDEADu64, vec![1])).unwrap()
        ));

        dispatcher.shutdown();
        let stats = dispatcher.stats();
        assert_eq!(stats.received, 5);
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.checksum_failed, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.route_failed, 2);
        assert_eq!(stats.settled(), 5);
        assert_eq!(recorder.seen.lock().as_slice(), &[good]);
    }

    #[test]
    fn test_shutdown_drains_accepted_work_and_rejects_new() {
        let recorder = Arc::new(Recorder::default());
        let tracker = Arc::new(GracefulShutdownTracker::new());
        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 4,
                queue_capacity: 64,
                max_datagram_size: 256,
            },
            recorder.clone(),
            tracker.clone(),
        )
        .unwrap();
        assert_eq!(tracker.get_count(), 4);

        for i in 0..32u64 {
            let cmd = MemoryOpCommand::copy(i, vec![i as u8]);
            dispatcher.submit_bytes(&encode_framed(&cmd).unwrap());
        }
        dispatcher.shutdown();

        assert_eq!(recorder.seen.lock().len(), 32);
        assert_eq!(tracker.get_count(), 0);
        assert!(!dispatcher.submit_bytes(&[0u8; 40]));
    }

    #[tokio::test]
    async fn test_udp_receive_loop() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Arc::new(start(recorder.clone(), 1, 16));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let token = CancellationToken::new();
        let receive_loop = {
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            tokio::spawn(async move { dispatcher.run_udp(socket, token).await })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cmd = MemoryOpCommand::fill(0x40u64, 0xEE, 16);
        sender
            .send_to(&encode_framed(&cmd).unwrap(), addr)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while dispatcher.stats().routed == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        receive_loop.await.unwrap().unwrap();
        tokio::task::spawn_blocking({
            let dispatcher = dispatcher.clone();
            move || dispatcher.shutdown()
        })
        .await
        .unwrap();

        assert_eq!(recorder.seen.lock().as_slice(), &[cmd]);
    }
}
