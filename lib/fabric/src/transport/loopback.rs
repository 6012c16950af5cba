// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process backend for single-host runs and tests.

use super::registration::{MemoryRegistrationHandle, RegistrationTable};
use super::{TransferError, Transport, TransportConfig};
use crate::memory::MemoryRegion;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sending half of a loopback endpoint's inbox
pub type LoopbackSender = mpsc::UnboundedSender<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Ready,
    Closed,
}

#[derive(Debug)]
pub struct LoopbackTransport {
    phase: Mutex<Phase>,
    listener: CancellationToken,
    inbox_tx: LoopbackSender,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    peer: Mutex<Option<LoopbackSender>>,
    registrations: RegistrationTable,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            phase: Mutex::new(Phase::Created),
            listener: CancellationToken::new(),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            peer: Mutex::new(None),
            registrations: RegistrationTable::new(),
        }
    }

    /// Two endpoints wired to each other
    pub fn pair() -> (Self, Self) {
        let a = Self::new();
        let b = Self::new();
        a.set_peer(b.inbox());
        b.set_peer(a.inbox());
        (a, b)
    }

    /// Handle other endpoints use to deliver into this one
    pub fn inbox(&self) -> LoopbackSender {
        self.inbox_tx.clone()
    }

    pub fn set_peer(&self, peer: LoopbackSender) {
        *self.peer.lock() = Some(peer);
    }

    pub fn registrations(&self) -> usize {
        self.registrations.len()
    }

    fn ensure_ready(&self) -> Result<(), TransferError> {
        match *self.phase.lock() {
            Phase::Ready => Ok(()),
            Phase::Created => Err(TransferError::NotInitialized),
            Phase::Closed => Err(TransferError::Closed),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn init(&self, config: TransportConfig) -> Result<(), TransferError> {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Created => {
                *phase = Phase::Ready;
                tracing::debug!(iface = %config.iface, "loopback transport initialised");
                Ok(())
            }
            Phase::Ready => Err(TransferError::AlreadyInitialized),
            Phase::Closed => Err(TransferError::Closed),
        }
    }

    fn register_memory(
        &self,
        region: MemoryRegion,
    ) -> Result<MemoryRegistrationHandle, TransferError> {
        self.ensure_ready()?;
        self.registrations.register(region)
    }

    fn unregister_memory(&self, handle: MemoryRegistrationHandle) -> Result<(), TransferError> {
        self.registrations.unregister(handle)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransferError> {
        self.ensure_ready()?;
        let peer = self.peer.lock().clone().ok_or(TransferError::NoPeer)?;
        peer.send(data).map_err(|_| TransferError::Closed)
    }

    async fn receive(&self) -> Result<Bytes, TransferError> {
        self.ensure_ready()?;
        let mut inbox = self.inbox_rx.lock().await;
        tokio::select! {
            _ = self.listener.cancelled() => Err(TransferError::Closed),
            data = inbox.recv() => data.ok_or(TransferError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransferError> {
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Closed {
                return Ok(());
            }
            *phase = Phase::Closed;
        }
        self.listener.cancel();
        self.peer.lock().take();
        self.registrations.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_data() {
        let (a, b) = LoopbackTransport::pair();
        a.init(TransportConfig::new("lo", 0)).await.unwrap();
        b.init(TransportConfig::new("lo", 0)).await.unwrap();

        a.send(Bytes::from_static(b"one")).await.unwrap();
        b.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(&b.receive().await.unwrap()[..], b"one");
        assert_eq!(&a.receive().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_requires_init() {
        let (a, _b) = LoopbackTransport::pair();
        assert!(matches!(
            a.send(Bytes::new()).await,
            Err(TransferError::NotInitialized)
        ));
        assert!(a.register_memory(MemoryRegion::new(0, 8)).is_err());
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let (a, _b) = LoopbackTransport::pair();
        a.init(TransportConfig::new("lo", 0)).await.unwrap();
        let _handle = a.register_memory(MemoryRegion::new(0x10, 8)).unwrap();
        assert_eq!(a.registrations(), 1);

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(a.registrations(), 0);
        assert!(matches!(a.receive().await, Err(TransferError::Closed)));
        assert!(matches!(
            a.init(TransportConfig::new("lo", 0)).await,
            Err(TransferError::Closed)
        ));
    }
}
