#![allow(clippy::cast_sign_loss)]

use crate::drm::Driver;
use crate::error::{BlasError, BlasResult};
use crate::runtime::memory::{DmaMemoryManager, MemoryRegion};
use crate::utils::{forward_offset, is_valid_alignment};
use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;

/// A user pointer handed out by [`AlignedAllocator`]: a view `offset` bytes into its
/// owning region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedAllocation {
    pub parent: MemoryRegion,
    pub offset: usize,
    pub size: usize,
}

impl AlignedAllocation {
    #[must_use]
    pub const fn user_addr(&self) -> usize {
        self.parent.virt_addr + self.offset
    }
}

/// Serves buffers whose *bus* address is aligned, on top of [`DmaMemoryManager`].
///
/// The driver has no notion of alignment, so each request over-allocates by
/// `alignment - 1` bytes and hands out an interior pointer. The side table maps that
/// pointer back to its owning region for `free`.
#[derive(Debug)]
pub struct AlignedAllocator {
    default_alignment: i32,
    live: HashMap<usize, AlignedAllocation>,
}

impl AlignedAllocator {
    pub const DEFAULT_ALIGNMENT: i32 = 32;

    #[must_use]
    pub fn new(default_alignment: i32) -> Self {
        let default_alignment = if is_valid_alignment(default_alignment) {
            default_alignment
        } else {
            Self::DEFAULT_ALIGNMENT
        };
        Self {
            default_alignment,
            live: HashMap::new(),
        }
    }

    /// Alignment actually used for a request.
    ///
    /// Invalid values (non-positive or not a power of two) are replaced by the default
    /// without an error, unlike every other argument check in this crate.
    #[must_use]
    pub const fn effective_alignment(&self, alignment: i32) -> usize {
        if is_valid_alignment(alignment) {
            alignment as usize
        } else {
            self.default_alignment as usize
        }
    }

    pub fn allocate(
        &mut self,
        memory: &mut DmaMemoryManager,
        driver: &dyn Driver,
        size: usize,
        alignment: i32,
    ) -> BlasResult<NonNull<u8>> {
        let alignment = self.effective_alignment(alignment);
        let request = size
            .checked_add(alignment - 1)
            .ok_or_else(|| BlasError::Allocation {
                size,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            })?;
        let parent = memory.allocate(driver, request)?;

        let offset = forward_offset(parent.bus_addr, alignment as u32) as usize;
        let allocation = AlignedAllocation {
            parent,
            offset,
            size,
        };
        let user_addr = allocation.user_addr();

        if self.live.contains_key(&user_addr) {
            // The manager just handed out this range, so a stale entry means the
            // bookkeeping is corrupt.
            memory.free(driver, parent.virt_addr)?;
            return Err(BlasError::UnknownAlignedPointer(user_addr));
        }
        self.live.insert(user_addr, allocation);

        log::trace!("aligned {size} bytes to {alignment}: user {user_addr:#x} (+{offset})");

        NonNull::new(user_addr as *mut u8).ok_or(BlasError::UnknownAddress(user_addr))
    }

    /// Release a pointer returned by `allocate`. Unknown and already-freed pointers fail.
    pub fn free(
        &mut self,
        memory: &mut DmaMemoryManager,
        driver: &dyn Driver,
        ptr: NonNull<u8>,
    ) -> BlasResult<()> {
        let user_addr = ptr.as_ptr() as usize;
        let allocation = self
            .live
            .remove(&user_addr)
            .ok_or(BlasError::UnknownAlignedPointer(user_addr))?;

        memory.free(driver, allocation.parent.virt_addr)
    }

    #[must_use]
    pub fn get(&self, ptr: NonNull<u8>) -> Option<&AlignedAllocation> {
        self.live.get(&(ptr.as_ptr() as usize))
    }

    /// Number of live aligned allocations.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Fails with `ResourceLeak` if anything is still allocated.
    pub fn check_released(&self) -> BlasResult<()> {
        if self.live.is_empty() {
            Ok(())
        } else {
            Err(BlasError::ResourceLeak(self.live.len()))
        }
    }
}

impl Default for AlignedAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ALIGNMENT)
    }
}
