// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! UDP backend.
//!
//! The endpoint binds to the first address of the configured interface. Outstanding sends are
//! bounded by `max_send_wr`; receives read one datagram of at most `max_datagram_size` bytes.

use super::interface::validate_interface;
use super::registration::{MemoryRegistrationHandle, RegistrationTable};
use super::{TransferError, Transport, TransportConfig};
use crate::memory::MemoryRegion;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Endpoint {
    /// Cancels pending receives
    listener: CancellationToken,
    /// Send work-request slots
    send_slots: Arc<Semaphore>,
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
}

#[derive(Debug)]
pub struct DatagramTransport {
    endpoint: RwLock<Option<Arc<Endpoint>>>,
    registrations: RegistrationTable,
    max_datagram_size: usize,
}

impl DatagramTransport {
    pub fn new(max_datagram_size: usize) -> Self {
        Self {
            endpoint: RwLock::new(None),
            registrations: RegistrationTable::new(),
            max_datagram_size,
        }
    }

    /// Bound address once initialised
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .read()
            .as_ref()
            .and_then(|e| e.socket.local_addr().ok())
    }

    pub fn is_initialized(&self) -> bool {
        self.endpoint.read().is_some()
    }

    fn endpoint(&self) -> Result<Arc<Endpoint>, TransferError> {
        self.endpoint
            .read()
            .clone()
            .ok_or(TransferError::NotInitialized)
    }
}

#[async_trait]
impl Transport for DatagramTransport {
    async fn init(&self, config: TransportConfig) -> Result<(), TransferError> {
        if self.is_initialized() {
            return Err(TransferError::AlreadyInitialized);
        }

        let info = validate_interface(&config.iface)?;
        let ip = info
            .preferred_address()
            .ok_or_else(|| TransferError::NoInterfaceAddress(config.iface.clone()))?;
        let socket = UdpSocket::bind(SocketAddr::new(ip, config.port)).await?;
        let local = socket.local_addr()?;

        let endpoint = Arc::new(Endpoint {
            listener: CancellationToken::new(),
            send_slots: Arc::new(Semaphore::new(config.max_send_wr.max(1) as usize)),
            socket: Arc::new(socket),
            peer: config.peer,
        });

        let mut slot = self.endpoint.write();
        if slot.is_some() {
            return Err(TransferError::AlreadyInitialized);
        }
        *slot = Some(endpoint);
        tracing::info!(
            iface = %config.iface,
            %local,
            peer = ?config.peer,
            "datagram transport initialised"
        );
        Ok(())
    }

    fn register_memory(
        &self,
        region: MemoryRegion,
    ) -> Result<MemoryRegistrationHandle, TransferError> {
        self.endpoint()?;
        self.registrations.register(region)
    }

    fn unregister_memory(&self, handle: MemoryRegistrationHandle) -> Result<(), TransferError> {
        self.registrations.unregister(handle)
    }

    async fn send(&self, data: Bytes) -> Result<(), TransferError> {
        let endpoint = self.endpoint()?;
        let peer = endpoint.peer.ok_or(TransferError::NoPeer)?;
        // the receiver reads at most max_datagram_size bytes and would truncate the rest
        if data.len() > self.max_datagram_size {
            return Err(TransferError::FrameTooLarge {
                len: data.len(),
                max: self.max_datagram_size,
            });
        }
        let _slot = endpoint
            .send_slots
            .acquire()
            .await
            .map_err(|_| TransferError::Closed)?;

        let sent = endpoint.socket.send_to(&data, peer).await?;
        if sent != data.len() {
            return Err(TransferError::ShortSend {
                sent,
                expected: data.len(),
            });
        }
        tracing::trace!(%peer, bytes = sent, "datagram sent");
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, TransferError> {
        let mut buf = Vec::new();
        self.receive_into(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn receive_into(&self, buf: &mut Vec<u8>) -> Result<(), TransferError> {
        let endpoint = self.endpoint()?;
        buf.resize(self.max_datagram_size, 0);
        tokio::select! {
            _ = endpoint.listener.cancelled() => Err(TransferError::Closed),
            result = endpoint.socket.recv_from(&mut buf[..]) => {
                let (len, from) = result?;
                tracing::trace!(%from, bytes = len, "datagram received");
                buf.truncate(len);
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), TransferError> {
        let Some(endpoint) = self.endpoint.write().take() else {
            return Ok(());
        };

        endpoint.listener.cancel();
        endpoint.send_slots.close();
        let leaked = self.registrations.clear();
        if leaked > 0 {
            tracing::warn!(leaked, "closing transport with live memory registrations");
        }
        drop(endpoint);
        tracing::info!("datagram transport closed");
        Ok(())
    }
}
