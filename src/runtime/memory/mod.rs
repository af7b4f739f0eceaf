pub mod aligned;
pub mod manager;

/// One driver-backed buffer shared between the CPU and the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub virt_addr: usize, // CPU virtual address of the mapping
    pub bus_addr: u32,    // Address the accelerator uses
    pub handle: u32,      // Driver buffer handle
    pub size: usize,      // Size in bytes
}

impl MemoryRegion {
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.virt_addr && addr - self.virt_addr < self.size
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.virt_addr + self.size
    }

    #[must_use]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.virt_addr as *mut u8
    }
}

/// Bus address and handle of a resolved CPU address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub bus_addr: u32,
    pub handle: u32,
}

// Re-export the main types for easy access
pub use aligned::{AlignedAllocation, AlignedAllocator};
pub use manager::DmaMemoryManager;
