pub mod device;
pub mod ioctl;
pub mod mock;

use crate::runtime::memory::MemoryRegion;
use std::io;

/// The capabilities the runtime consumes from the kernel driver.
///
/// Buffer allocation returns CPU/accelerator-coherent memory already mapped into the
/// process. Job submission only enqueues; completion is observed by waiting on the
/// handle of a buffer the job writes.
pub trait Driver: Send {
    /// Allocate and map a driver-backed buffer of `size` bytes.
    fn alloc_buffer(&self, size: usize) -> io::Result<MemoryRegion>;

    /// Unmap and release a buffer returned by `alloc_buffer`.
    fn free_buffer(&self, region: &MemoryRegion) -> io::Result<()>;

    /// Enqueue a compute shader dispatch referencing `handles`.
    fn submit_csd(&self, cfg: &[u32; 7], coef: &[u32; 4], handles: &[u32]) -> io::Result<()>;

    /// Block until all work writing `handle` is done, or `timeout_ns` elapses (`ETIME`).
    fn wait_bo(&self, handle: u32, timeout_ns: u64) -> io::Result<()>;
}
