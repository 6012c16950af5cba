// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory registrations held by a transport.

use super::TransferError;
use crate::memory::MemoryRegion;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Proof of a live registration. Not cloneable: giving it back to
/// [`super::Transport::unregister_memory`] is the only way to release the region.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a registration stays live until the handle is unregistered"]
pub struct MemoryRegistrationHandle {
    id: u64,
    region: MemoryRegion,
}

impl MemoryRegistrationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }
}

/// Region base address → registration id
#[derive(Debug, Default)]
pub struct RegistrationTable {
    live: Mutex<HashMap<u64, (u64, MemoryRegion)>>,
    next_id: AtomicU64,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, region: MemoryRegion) -> Result<MemoryRegistrationHandle, TransferError> {
        let mut live = self.live.lock();
        if live.contains_key(&region.addr) {
            return Err(TransferError::AlreadyRegistered(region.addr));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        live.insert(region.addr, (id, region));
        tracing::debug!(
            id,
            addr = format_args!("{:#x}", region.addr),
            size = region.size,
            "memory registered"
        );
        Ok(MemoryRegistrationHandle { id, region })
    }

    pub fn unregister(&self, handle: MemoryRegistrationHandle) -> Result<(), TransferError> {
        let mut live = self.live.lock();
        match live.get(&handle.region.addr) {
            Some((id, _)) if *id == handle.id => {
                live.remove(&handle.region.addr);
                tracing::debug!(id = handle.id, "memory unregistered");
                Ok(())
            }
            _ => Err(TransferError::NotRegistered(handle.region.addr)),
        }
    }

    pub fn is_registered(&self, addr: u64) -> bool {
        self.live.lock().contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration; returns how many were still live
    pub fn clear(&self) -> usize {
        let mut live = self.live.lock();
        let count = live.len();
        live.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_registration_rejected() {
        let table = RegistrationTable::new();
        let region = MemoryRegion::new(0x1000, 4096);

        let handle = table.register(region).unwrap();
        assert!(matches!(
            table.register(region),
            Err(TransferError::AlreadyRegistered(0x1000))
        ));

        table.unregister(handle).unwrap();
        assert!(table.is_empty());

        // region can be registered again once released
        let handle = table.register(region).unwrap();
        assert_eq!(handle.region(), region);
        assert_eq!(table.clear(), 1);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let table = RegistrationTable::new();
        let region = MemoryRegion::new(0x2000, 64);
        let stale = table.register(region).unwrap();
        assert_eq!(table.clear(), 1);
        let _fresh = table.register(region).unwrap();

        assert!(matches!(
            table.unregister(stale),
            Err(TransferError::NotRegistered(0x2000))
        ));
        assert!(table.is_registered(0x2000));
    }
}
