#![allow(clippy::cast_possible_truncation)]

use crate::drm::Driver;
use crate::error::{BlasError, BlasResult};
use crate::runtime::memory::{MemoryRegion, Resolved};
use std::collections::BTreeMap;

const MIN_ALLOC_SIZE: usize = 4096;

/// Tracks every live driver-backed buffer of the process.
///
/// Regions are keyed by their CPU base address so that any address inside a region
/// resolves to the region's bus address plus the same offset.
#[derive(Debug, Default)]
pub struct DmaMemoryManager {
    regions: BTreeMap<usize, MemoryRegion>,
}

impl DmaMemoryManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a coherent buffer of at least `size` bytes.
    pub fn allocate(&mut self, driver: &dyn Driver, size: usize) -> BlasResult<MemoryRegion> {
        let size = if size == 0 { MIN_ALLOC_SIZE } else { size };

        let region = driver
            .alloc_buffer(size)
            .map_err(|source| BlasError::Allocation { size, source })?;

        log::debug!(
            "allocated {} bytes: virt {:#x} bus {:#010x} handle {}",
            region.size,
            region.virt_addr,
            region.bus_addr,
            region.handle
        );

        self.regions.insert(region.virt_addr, region);
        Ok(region)
    }

    /// Release the region whose CPU base address is `virt_addr`.
    pub fn free(&mut self, driver: &dyn Driver, virt_addr: usize) -> BlasResult<()> {
        let region = self
            .regions
            .remove(&virt_addr)
            .ok_or(BlasError::UnknownAddress(virt_addr))?;

        driver
            .free_buffer(&region)
            .map_err(|source| BlasError::Free {
                handle: region.handle,
                source,
            })?;

        log::debug!("freed handle {} ({:#x})", region.handle, virt_addr);
        Ok(())
    }

    /// The live region containing `addr`.
    pub fn region_of(&self, addr: usize) -> BlasResult<&MemoryRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
            .ok_or(BlasError::UnknownAddress(addr))
    }

    /// Bus address and handle for any address inside a live region.
    pub fn resolve(&self, addr: usize) -> BlasResult<Resolved> {
        let region = self.region_of(addr)?;
        Ok(Resolved {
            bus_addr: region.bus_addr + (addr - region.virt_addr) as u32,
            handle: region.handle,
        })
    }

    /// Like `resolve`, but also requires `[addr, addr + len)` to lie inside the region.
    pub fn resolve_span(&self, addr: usize, len: usize) -> BlasResult<Resolved> {
        let region = self.region_of(addr)?;
        if addr + len > region.end() {
            return Err(BlasError::SpanOutOfRegion { addr, len });
        }
        self.resolve(addr)
    }

    /// Number of live regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
