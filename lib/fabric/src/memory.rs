// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Node-local memory.
//!
//! Destinations arrive as opaque [`AddressHandle`]s. The only way to touch the bytes behind a
//! handle is [`LocalAddressSpace::with_range_mut`], which resolves the handle to a registered
//! region and bounds-checks the whole range before handing out a slice.

use crate::codec::AddressHandle;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// How long an access waits for a region held by another worker before reporting
/// [`MemoryError::Busy`]
const REGION_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("address {0} is not backed by any local region")]
    Unmapped(AddressHandle),

    #[error("range {addr}+{len} exceeds region [{base:#x}, {end:#x})")]
    OutOfBounds {
        addr: AddressHandle,
        len: usize,
        base: u64,
        end: u64,
    },

    #[error("region at {0:#x} is busy")]
    Busy(u64),

    #[error("region [{base:#x}, +{size}) overlaps an existing region")]
    Overlap { base: u64, size: usize },
}

impl MemoryError {
    /// Transient faults that may succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::Busy(_))
    }
}

/// An unowned contiguous chunk of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub addr: u64,
    pub size: usize,
}

impl MemoryRegion {
    pub fn new(addr: u64, size: usize) -> Self {
        Self { addr, size }
    }

    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size as u64)
    }

    pub fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end())
    }
}

/// Memory operations the router applies on the local node
pub trait LocalMemory: Send + Sync {
    /// Copy `data` to `dst`
    fn copy_in(&self, dst: AddressHandle, data: &[u8]) -> Result<(), MemoryError>;

    /// Fill `len` bytes at `dst` with `value`
    fn fill(&self, dst: AddressHandle, len: usize, value: u8) -> Result<(), MemoryError>;
}

/// Host-backed region addressed from `base`
pub struct HostRegion {
    region: MemoryRegion,
    data: Mutex<Box<[u8]>>,
}

impl std::fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegion")
            .field("region", &self.region)
            .finish()
    }
}

impl HostRegion {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            region: MemoryRegion::new(base, size),
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    /// Host pointer of the backing allocation, for transport registration
    pub fn host_ptr(&self) -> u64 {
        self.data.lock().as_ptr() as u64
    }

    /// Copy of `len` bytes starting at `addr`
    pub fn read(&self, addr: AddressHandle, len: usize) -> Result<Vec<u8>, MemoryError> {
        let offset = self.offset_of(addr, len)?;
        let data = self.data.lock();
        Ok(data[offset..offset + len].to_vec())
    }

    fn offset_of(&self, addr: AddressHandle, len: usize) -> Result<usize, MemoryError> {
        if !self.region.contains(addr.raw(), len) {
            return Err(MemoryError::OutOfBounds {
                addr,
                len,
                base: self.region.addr,
                end: self.region.end(),
            });
        }
        Ok((addr.raw() - self.region.addr) as usize)
    }

    fn with_range_mut<R>(
        &self,
        addr: AddressHandle,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemoryError> {
        let offset = self.offset_of(addr, len)?;
        let mut data = self
            .data
            .try_lock_for(REGION_LOCK_TIMEOUT)
            .ok_or(MemoryError::Busy(self.region.addr))?;
        Ok(f(&mut data[offset..offset + len]))
    }
}

/// Set of host regions owned by this node, keyed by base address
#[derive(Debug, Default)]
pub struct LocalAddressSpace {
    regions: RwLock<BTreeMap<u64, Arc<HostRegion>>>,
}

impl LocalAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and map a zeroed region of `size` bytes at `base`
    pub fn map_region(&self, base: u64, size: usize) -> Result<Arc<HostRegion>, MemoryError> {
        let candidate = MemoryRegion::new(base, size);
        let mut regions = self.regions.write();

        let overlaps = regions.values().any(|existing| {
            let r = existing.region();
            candidate.addr < r.end() && r.addr < candidate.end()
        });
        if overlaps || size == 0 {
            return Err(MemoryError::Overlap { base, size });
        }

        let region = Arc::new(HostRegion::new(base, size));
        regions.insert(base, region.clone());
        tracing::debug!(base = format_args!("{base:#x}"), size, "mapped local region");
        Ok(region)
    }

    pub fn unmap_region(&self, base: u64) -> Option<Arc<HostRegion>> {
        self.regions.write().remove(&base)
    }

    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.regions.read().values().map(|r| r.region()).collect()
    }

    /// Region whose range starts at or below `addr` and contains it
    pub fn region_for(&self, addr: AddressHandle) -> Option<Arc<HostRegion>> {
        let regions = self.regions.read();
        regions
            .range(..=addr.raw())
            .next_back()
            .filter(|(_, region)| addr.raw() < region.region().end())
            .map(|(_, region)| region.clone())
    }

    /// Run `f` on the `len` bytes at `addr`. The range must lie inside a single region.
    pub fn with_range_mut<R>(
        &self,
        addr: AddressHandle,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemoryError> {
        let region = self.region_for(addr).ok_or(MemoryError::Unmapped(addr))?;
        region.with_range_mut(addr, len, f)
    }

    pub fn read(&self, addr: AddressHandle, len: usize) -> Result<Vec<u8>, MemoryError> {
        let region = self.region_for(addr).ok_or(MemoryError::Unmapped(addr))?;
        region.read(addr, len)
    }
}

impl LocalMemory for LocalAddressSpace {
    fn copy_in(&self, dst: AddressHandle, data: &[u8]) -> Result<(), MemoryError> {
        self.with_range_mut(dst, data.len(), |range| range.copy_from_slice(data))
    }

    fn fill(&self, dst: AddressHandle, len: usize, value: u8) -> Result<(), MemoryError> {
        self.with_range_mut(dst, len, |range| range.fill(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> LocalAddressSpace {
        let space = LocalAddressSpace::new();
        space.map_region(0x1000, 64).unwrap();
        space.map_region(0x4000, 16).unwrap();
        space
    }

    #[test]
    fn test_copy_and_fill() {
        let space = space();
        space.copy_in(AddressHandle::new(0x1004), b"abcd").unwrap();
        space.fill(AddressHandle::new(0x4000), 16, 0x5A).unwrap();

        assert_eq!(space.read(AddressHandle::new(0x1004), 4).unwrap(), b"abcd");
        assert_eq!(space.read(AddressHandle::new(0x4000), 16).unwrap(), vec![0x5A; 16]);
    }

    #[test]
    fn test_range_must_fit_region() {
        let space = space();
        let err = space
            .copy_in(AddressHandle::new(0x103C), &[0u8; 8])
            .unwrap_err();
        assert!(matches!(err, MemoryError::OutOfBounds { len: 8, .. }));
        assert!(!err.is_retryable());
        // nothing was written
        assert_eq!(space.read(AddressHandle::new(0x103C), 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_gap_between_regions_is_unmapped() {
        let space = space();
        assert_eq!(
            space.fill(AddressHandle::new(0x2000), 1, 0).unwrap_err(),
            MemoryError::Unmapped(AddressHandle::new(0x2000))
        );
        assert_eq!(
            space.fill(AddressHandle::new(0x0FFF), 1, 0).unwrap_err(),
            MemoryError::Unmapped(AddressHandle::new(0x0FFF))
        );
    }

    #[test]
    fn test_overlapping_map_rejected() {
        let space = space();
        assert!(matches!(
            space.map_region(0x1020, 64),
            Err(MemoryError::Overlap { .. })
        ));
        assert!(space.map_region(0x1040, 64).is_ok());
    }

    #[test]
    fn test_busy_region_is_retryable() {
        let space = space();
        let region = space.region_for(AddressHandle::new(0x1000)).unwrap();
        let _held = region.data.lock();
        let err = space.fill(AddressHandle::new(0x1000), 1, 1).unwrap_err();
        assert_eq!(err, MemoryError::Busy(0x1000));
        assert!(err.is_retryable());
    }
}
