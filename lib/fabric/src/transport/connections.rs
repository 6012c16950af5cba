// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-peer transports for the forward path.
//!
//! One initialised transport per peer IP, created the first time a command is forwarded to
//! that peer and kept until shutdown.

use super::datagram::DatagramTransport;
use super::{TransferError, Transport, TransportConfig};
use crate::codec::{self, MemoryOpCommand};
use crate::routing::Forwarder;
use crate::topology::NodeId;

use bytes::Bytes;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Builds uninitialised transports for new peers
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Transport> {
        self()
    }
}

/// Produces [`DatagramTransport`]s
#[derive(Debug, Clone)]
pub struct DatagramFactory {
    pub max_datagram_size: usize,
}

impl TransportFactory for DatagramFactory {
    fn create(&self) -> Arc<dyn Transport> {
        Arc::new(DatagramTransport::new(self.max_datagram_size))
    }
}

pub struct ConnectionRegistry {
    connections: DashMap<IpAddr, Arc<dyn Transport>>,
    connecting: tokio::sync::Mutex<()>,
    factory: Arc<dyn TransportFactory>,
    template: TransportConfig,
    peer_port: u16,
    runtime: tokio::runtime::Handle,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("template", &self.template)
            .field("peer_port", &self.peer_port)
            .finish()
    }
}

impl ConnectionRegistry {
    /// `template` is used for every new transport with the peer filled in as
    /// `(peer ip, peer_port)`. Blocking forwards run on `runtime`.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        template: TransportConfig,
        peer_port: u16,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            connecting: tokio::sync::Mutex::new(()),
            factory,
            template,
            peer_port,
            runtime,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The transport for `peer`, initialising one on first use
    pub async fn connection(&self, peer: IpAddr) -> Result<Arc<dyn Transport>, TransferError> {
        if let Some(existing) = self.connections.get(&peer) {
            return Ok(existing.clone());
        }

        let _connecting = self.connecting.lock().await;
        if let Some(existing) = self.connections.get(&peer) {
            return Ok(existing.clone());
        }

        let transport = self.factory.create();
        let config = self
            .template
            .clone()
            .with_peer(SocketAddr::new(peer, self.peer_port));
        if let Err(e) = transport.init(config).await {
            // release whatever the failed init left behind
            let _ = transport.close().await;
            return Err(e);
        }

        tracing::info!(%peer, port = self.peer_port, "opened connection to peer");
        self.connections.insert(peer, transport.clone());
        Ok(transport)
    }

    pub async fn send_to(&self, peer: IpAddr, data: Bytes) -> Result<(), TransferError> {
        let transport = self.connection(peer).await?;
        match transport.send(data).await {
            Err(e @ (TransferError::Closed | TransferError::NotInitialized)) => {
                // dead endpoint; the next forward reconnects
                self.connections.remove(&peer);
                Err(e)
            }
            result => result,
        }
    }

    /// Close every peer transport
    pub async fn close_all(&self) {
        let peers: Vec<IpAddr> = self.connections.iter().map(|e| *e.key()).collect();
        for peer in peers {
            let Some((_, transport)) = self.connections.remove(&peer) else {
                continue;
            };
            if let Err(e) = transport.close().await {
                tracing::warn!(%peer, error = %e, "failed to close peer transport");
            }
        }
        tracing::info!("peer connections closed");
    }
}

impl Forwarder for ConnectionRegistry {
    /// Blocks the calling thread until the send completes. Must not be called from an async
    /// task; ingress workers and `spawn_blocking` closures are fine.
    fn forward(
        &self,
        node: NodeId,
        addr: IpAddr,
        cmd: &MemoryOpCommand,
    ) -> Result<(), TransferError> {
        let frame = codec::encode_framed(cmd)?;
        tracing::trace!(%node, %addr, bytes = frame.len(), "forwarding command");
        self.runtime.block_on(self.send_to(addr, frame))
    }
}
