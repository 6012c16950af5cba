// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Routing Engine
//!
//! For every command the router asks where it is running and who owns the destination. Both
//! answers are looked up fresh; address ranges may migrate between nodes at any time. When the
//! two agree the operation is applied to local memory, retrying transient faults under a
//! [`RetryPolicy`]. Otherwise the command is re-checksummed and forwarded to the owner's IP
//! through a [`Forwarder`].

use crate::codec::{AddressHandle, MemoryOpCommand, Operation};
use crate::memory::{LocalMemory, MemoryError};
use crate::routes::RouteTable;
use crate::topology::{AddressResolver, NodeId, NodeLocator};
use crate::transport::TransferError;

use aitherion_runtime::utils::retry::{RetryError, RetryPolicy, retry_blocking};
use derive_builder::Builder;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no route to node {0}")]
    RouteNotFound(NodeId),

    #[error("destination {0} is not owned by any node")]
    UnmappedAddress(AddressHandle),

    #[error("set command carries no fill value")]
    InvalidPayload,

    #[error("local memory fault: {0}")]
    Memory(MemoryError),

    #[error("local memory access failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: MemoryError },

    #[error("forward to node {node} failed: {source}")]
    Transfer {
        node: NodeId,
        #[source]
        source: TransferError,
    },
}

/// Sends a command to the node that owns its destination
pub trait Forwarder: Send + Sync {
    fn forward(
        &self,
        node: NodeId,
        addr: IpAddr,
        cmd: &MemoryOpCommand,
    ) -> Result<(), TransferError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Applied to this node's memory
    Local { node: NodeId },
    /// Handed to the transport for `node`
    Forwarded { node: NodeId, addr: IpAddr },
}

impl fmt::Display for RouteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteOutcome::Local { node } => write!(f, "local(node {node})"),
            RouteOutcome::Forwarded { node, addr } => write!(f, "forwarded(node {node} @ {addr})"),
        }
    }
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct Router {
    locator: Arc<dyn NodeLocator>,
    resolver: Arc<dyn AddressResolver>,
    routes: Arc<RouteTable>,
    memory: Arc<dyn LocalMemory>,
    forwarder: Arc<dyn Forwarder>,
    #[builder(default = "RetryPolicy::local_memory()")]
    retry: RetryPolicy,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .field("retry", &self.retry)
            .finish()
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn route(&self, cmd: &MemoryOpCommand) -> Result<RouteOutcome, RouteError> {
        if cmd.operation() == Operation::Set && cmd.payload().is_empty() {
            return Err(RouteError::InvalidPayload);
        }

        let local = self.locator.current_node();
        let target = self
            .resolver
            .resolve_address_node(cmd.destination())
            .ok_or(RouteError::UnmappedAddress(cmd.destination()))?;

        if target == local {
            self.apply_local(cmd)?;
            tracing::debug!(
                op = %cmd.operation(),
                dst = %cmd.destination(),
                bytes = cmd.data_size(),
                node = %local,
                "applied locally"
            );
            return Ok(RouteOutcome::Local { node: local });
        }

        let addr = self
            .routes
            .lookup(target)
            .ok_or(RouteError::RouteNotFound(target))?;
        let outbound = cmd.with_fresh_checksum();
        self.forwarder
            .forward(target, addr, &outbound)
            .map_err(|source| RouteError::Transfer {
                node: target,
                source,
            })?;

        tracing::debug!(
            op = %cmd.operation(),
            dst = %cmd.destination(),
            from = %local,
            to = %target,
            %addr,
            "forwarded"
        );
        Ok(RouteOutcome::Forwarded { node: target, addr })
    }

    fn apply_local(&self, cmd: &MemoryOpCommand) -> Result<(), RouteError> {
        let result = retry_blocking(&self.retry, MemoryError::is_retryable, |_| {
            match cmd.operation() {
                Operation::Copy => self.memory.copy_in(cmd.destination(), cmd.payload()),
                Operation::Set => self.memory.fill(
                    cmd.destination(),
                    cmd.data_size() as usize,
                    cmd.payload()[0],
                ),
            }
        });

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Permanent { error, .. }) => Err(RouteError::Memory(error)),
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(
                    dst = %cmd.destination(),
                    attempts,
                    error = %last,
                    "local memory access failed"
                );
                Err(RouteError::RetriesExhausted { attempts, last })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalAddressSpace;
    use crate::topology::{AddressMap, FixedNode};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingForwarder {
        sent: Mutex<Vec<(NodeId, IpAddr, MemoryOpCommand)>>,
        fail: bool,
    }

    impl Forwarder for RecordingForwarder {
        fn forward(
            &self,
            node: NodeId,
            addr: IpAddr,
            cmd: &MemoryOpCommand,
        ) -> Result<(), TransferError> {
            if self.fail {
                return Err(TransferError::Closed);
            }
            self.sent.lock().push((node, addr, cmd.clone()));
            Ok(())
        }
    }

    /// Fails the first `failures` calls with a busy fault
    struct FlakyMemory {
        inner: LocalAddressSpace,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyMemory {
        fn new(failures: u32) -> Self {
            let inner = LocalAddressSpace::new();
            inner.map_region(0x1000, 0x100).unwrap();
            Self {
                inner,
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn check(&self) -> Result<(), MemoryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(MemoryError::Busy(0x1000));
            }
            Ok(())
        }
    }

    impl LocalMemory for FlakyMemory {
        fn copy_in(&self, dst: AddressHandle, data: &[u8]) -> Result<(), MemoryError> {
            self.check()?;
            self.inner.copy_in(dst, data)
        }

        fn fill(&self, dst: AddressHandle, len: usize, value: u8) -> Result<(), MemoryError> {
            self.check()?;
            self.inner.fill(dst, len, value)
        }
    }

    struct Fixture {
        router: Router,
        memory: Arc<FlakyMemory>,
        forwarder: Arc<RecordingForwarder>,
    }

    fn fixture(failures: u32, fail_forward: bool) -> Fixture {
        let map = AddressMap::new();
        map.insert(0x1000, 0x100, NodeId(1)).unwrap();
        map.insert(0x2000, 0x100, NodeId(2)).unwrap();
        map.insert(0x3000, 0x100, NodeId(3)).unwrap();

        let routes = RouteTable::new(HashMap::from([
            (NodeId(1), "10.0.0.1".parse().unwrap()),
            (NodeId(2), "10.0.0.2".parse().unwrap()),
        ]));

        let memory = Arc::new(FlakyMemory::new(failures));
        let forwarder = Arc::new(RecordingForwarder {
            fail: fail_forward,
            ..Default::default()
        });

        let router = Router::builder()
            .locator(Arc::new(FixedNode(NodeId(1))))
            .resolver(Arc::new(map))
            .routes(Arc::new(routes))
            .memory(memory.clone())
            .forwarder(forwarder.clone())
            .retry(RetryPolicy::linear(3, Duration::from_millis(1)))
            .build()
            .unwrap();

        Fixture {
            router,
            memory,
            forwarder,
        }
    }

    #[test]
    fn test_local_copy_and_set() {
        let f = fixture(0, false);
        let outcome = f
            .router
            .route(&MemoryOpCommand::copy(0x1010u64, b"data".to_vec()))
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Local { node: NodeId(1) });

        f.router
            .route(&MemoryOpCommand::fill(0x1080u64, 0xAB, 8))
            .unwrap();
        assert_eq!(
            f.memory.inner.read(AddressHandle::new(0x1010), 4).unwrap(),
            b"data"
        );
        assert_eq!(
            f.memory.inner.read(AddressHandle::new(0x1080), 8).unwrap(),
            vec![0xAB; 8]
        );
        assert!(f.forwarder.sent.lock().is_empty());
    }

    #[test]
    fn test_remote_forward_preserves_payload_and_checksum() {
        let f = fixture(0, false);
        let cmd = MemoryOpCommand::copy(0x2004u64, b"remote".to_vec());
        let outcome = f.router.route(&cmd).unwrap();

        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Forwarded {
                node: NodeId(2),
                addr
            }
        );

        let sent = f.forwarder.sent.lock();
        assert_eq!(sent.len(), 1);
        let (node, to, forwarded) = &sent[0];
        assert_eq!((*node, *to), (NodeId(2), addr));
        assert_eq!(forwarded.payload(), cmd.payload());
        assert_eq!(forwarded.checksum(), crc32fast::hash(b"remote"));
        // nothing touched locally
        assert_eq!(f.memory.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_route_and_unmapped_destination() {
        let f = fixture(0, false);
        assert!(matches!(
            f.router.route(&MemoryOpCommand::copy(0x3000u64, vec![1])),
            Err(RouteError::RouteNotFound(NodeId(3)))
        ));
        assert!(matches!(
            f.router.route(&MemoryOpCommand::copy(0x9000u64, vec![1])),
            Err(RouteError::UnmappedAddress(_))
        ));
    }

    #[test]
    fn test_empty_set_rejected() {
        let f = fixture(0, false);
        assert!(matches!(
            f.router.route(&MemoryOpCommand::fill(0x1000u64, 0, 0)),
            Err(RouteError::InvalidPayload)
        ));
    }

    #[test]
    fn test_local_retry_recovers_after_two_failures() {
        let f = fixture(2, false);
        f.router
            .route(&MemoryOpCommand::copy(0x1000u64, vec![7]))
            .unwrap();
        assert_eq!(f.memory.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_local_retry_exhausted_without_fourth_attempt() {
        let f = fixture(3, false);
        let err = f
            .router
            .route(&MemoryOpCommand::copy(0x1000u64, vec![7]))
            .unwrap_err();
        assert!(matches!(err, RouteError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(f.memory.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_bounds_fault_not_retried() {
        let f = fixture(0, false);
        let err = f
            .router
            .route(&MemoryOpCommand::copy(0x10F0u64, vec![0; 32]))
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::Memory(MemoryError::OutOfBounds { .. })
        ));
        assert_eq!(f.memory.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forward_failure_surfaces_immediately() {
        let f = fixture(0, true);
        let err = f
            .router
            .route(&MemoryOpCommand::copy(0x2000u64, vec![1]))
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::Transfer {
                node: NodeId(2),
                source: TransferError::Closed
            }
        ));
    }

    #[test]
    fn test_destination_lookup_is_not_cached() {
        let map = Arc::new(AddressMap::new());
        map.insert(0x1000, 0x100, NodeId(1)).unwrap();
        let memory = Arc::new(LocalAddressSpace::new());
        memory.map_region(0x1000, 0x100).unwrap();
        let forwarder = Arc::new(RecordingForwarder::default());

        let router = Router::builder()
            .locator(Arc::new(FixedNode(NodeId(1))))
            .resolver(map.clone())
            .routes(Arc::new(
                RouteTable::from_json(r#"{"2": "10.0.0.2"}"#).unwrap(),
            ))
            .memory(memory)
            .forwarder(forwarder.clone())
            .build()
            .unwrap();

        let cmd = MemoryOpCommand::copy(0x1000u64, vec![1, 2]);
        assert!(matches!(router.route(&cmd), Ok(RouteOutcome::Local { .. })));

        map.migrate(0x1000, NodeId(2)).unwrap();
        assert!(matches!(
            router.route(&cmd),
            Ok(RouteOutcome::Forwarded { node: NodeId(2), .. })
        ));
        assert_eq!(forwarder.sent.lock().len(), 1);
    }
}
