// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport Manager
//!
//! A [`Transport`] is one initialised endpoint on the data-plane fabric: it is bound to a
//! named interface, owns the memory registrations made through it and sends framed commands
//! to a single peer. Backends are swappable; [`datagram::DatagramTransport`] runs over UDP and
//! [`loopback::LoopbackTransport`] stays in-process.

pub mod connections;
pub mod datagram;
pub mod interface;
pub mod loopback;
pub mod registration;

use crate::codec::CodecError;
use crate::memory::MemoryRegion;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub use connections::{ConnectionRegistry, DatagramFactory, TransportFactory};
pub use registration::{MemoryRegistrationHandle, RegistrationTable};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("interface {0} is down")]
    InterfaceDown(String),

    #[error("interface {0} has no usable address")]
    NoInterfaceAddress(String),

    #[error("transport is not initialised")]
    NotInitialized,

    #[error("transport is already initialised")]
    AlreadyInitialized,

    #[error("transport is closed")]
    Closed,

    #[error("transport has no peer to send to")]
    NoPeer,

    #[error("region at {0:#x} is already registered")]
    AlreadyRegistered(u64),

    #[error("region at {0:#x} is not registered")]
    NotRegistered(u64),

    #[error("frame of {len} bytes exceeds the {max}-byte datagram limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("short send: {sent} of {expected} bytes")]
    ShortSend { sent: usize, expected: usize },

    #[error("encode failed: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for [`Transport::init`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Interface the endpoint binds to; must exist and be up
    pub iface: String,
    /// Local port; 0 picks an ephemeral port
    pub port: u16,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_inline: u32,
    /// Destination for [`Transport::send`]
    pub peer: Option<SocketAddr>,
}

impl TransportConfig {
    pub fn new(iface: impl Into<String>, port: u16) -> Self {
        Self {
            iface: iface.into(),
            port,
            max_send_wr: 1024,
            max_recv_wr: 1024,
            max_inline: 64,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Build from the process-level transport settings
    pub fn from_settings(
        iface: impl Into<String>,
        settings: &aitherion_runtime::TransportSettings,
    ) -> Self {
        Self {
            iface: iface.into(),
            port: settings.port,
            max_send_wr: settings.max_send_wr,
            max_recv_wr: settings.max_recv_wr,
            max_inline: settings.max_inline,
            peer: None,
        }
    }
}

/// A fabric endpoint.
///
/// `send` and `receive` complete only when the transfer has completed; any non-OK completion
/// is a [`TransferError`]. `close` tears down listener, worker and context in that order, is
/// idempotent and tolerates an endpoint whose `init` failed halfway.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn init(&self, config: TransportConfig) -> Result<(), TransferError>;

    /// Register `region` for transfers. A region can hold one live registration.
    fn register_memory(
        &self,
        region: MemoryRegion,
    ) -> Result<MemoryRegistrationHandle, TransferError>;

    fn unregister_memory(&self, handle: MemoryRegistrationHandle) -> Result<(), TransferError>;

    async fn send(&self, data: Bytes) -> Result<(), TransferError>;

    async fn receive(&self) -> Result<Bytes, TransferError>;

    /// Receive one transfer into `buf`, replacing its contents
    async fn receive_into(&self, buf: &mut Vec<u8>) -> Result<(), TransferError> {
        let data = self.receive().await?;
        buf.clear();
        buf.extend_from_slice(&data);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransferError>;
}
