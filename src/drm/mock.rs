#![allow(clippy::cast_possible_truncation)]

//! A host-memory [`Driver`] for running the runtime without a V3D device.
//!
//! Buffers live in ordinary heap memory and receive synthetic bus addresses that are
//! only 4-byte aligned, so bus-address alignment logic is actually exercised. Jobs are
//! queued by `submit_csd` and executed on the next `wait_bo`, mirroring the
//! fire-and-forget behaviour of the hardware queue. A buffer closed while a queued job
//! references it stays allocated until that job has run, as GEM objects do. Kernels are
//! recognised by their image bytes and emulated according to their uniform layouts.

use crate::drm::Driver;
use crate::runtime::kernels::{KernelKind, KernelLibrary};
use crate::runtime::memory::MemoryRegion;
use crate::utils::align_up;
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::io;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const PAGE_SIZE: usize = 4096;
const BUS_BASE: u32 = 0xC000_0004;
/// Gap left between consecutive buffers, keeps bus addresses off any coarse boundary.
const BUS_GAP: u32 = 0x44;

/// What the mock saw for one `submit_csd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub cfg: [u32; 7],
    pub handles: Vec<u32>,
    pub kernel: KernelKind,
}

#[derive(Debug)]
struct MockBuffer {
    region: MemoryRegion,
    layout: Layout,
    /// Freed by the caller but still referenced by a queued job.
    closed: bool,
}

#[derive(Debug, Clone)]
struct Launch {
    kernel: KernelKind,
    unif_bus: u32,
    handles: Vec<u32>,
}

#[derive(Debug)]
struct MockState {
    buffers: BTreeMap<u32, MockBuffer>,
    next_handle: u32,
    next_bus: u32,
    kernels: Vec<(Vec<u8>, KernelKind)>,
    pending: Vec<Launch>,
    submissions: Vec<SubmitRecord>,
    waits: Vec<u32>,
    fail_allocations: bool,
    fail_submissions: bool,
    hang: bool,
}

/// Cloning yields another handle onto the same simulated device.
#[derive(Debug, Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A device that recognises every [`KernelLibrary::placeholder`] image.
    #[must_use]
    pub fn new() -> Self {
        let state = MockState {
            buffers: BTreeMap::new(),
            next_handle: 1,
            next_bus: BUS_BASE,
            kernels: Vec::new(),
            pending: Vec::new(),
            submissions: Vec::new(),
            waits: Vec::new(),
            fail_allocations: false,
            fail_submissions: false,
            hang: false,
        };
        let driver = Self {
            state: Arc::new(Mutex::new(state)),
        };
        for (kind, image) in KernelLibrary::placeholder().iter() {
            driver.register_kernel(kind, image);
        }
        driver
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emulate `kind` whenever a job's code address holds `image`.
    pub fn register_kernel(&self, kind: KernelKind, image: &[u8]) {
        self.state().kernels.push((image.to_vec(), kind));
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state().fail_allocations = fail;
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.state().fail_submissions = fail;
    }

    /// While set, every wait times out and queued jobs never run.
    pub fn hang(&self, hang: bool) {
        self.state().hang = hang;
    }

    #[must_use]
    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state().submissions.clone()
    }

    /// Handles passed to `wait_bo`, in call order.
    #[must_use]
    pub fn waits(&self) -> Vec<u32> {
        self.state().waits.clone()
    }

    /// Buffers allocated and not yet freed by the caller.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.state().buffers.values().filter(|b| !b.closed).count()
    }

    /// Jobs submitted but not yet executed.
    #[must_use]
    pub fn pending_jobs(&self) -> usize {
        self.state().pending.len()
    }
}

impl Driver for MockDriver {
    fn alloc_buffer(&self, size: usize) -> io::Result<MemoryRegion> {
        let mut state = self.state();
        if state.fail_allocations {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let span = u32::try_from(align_up(size, 4))
            .ok()
            .and_then(|s| s.checked_add(BUS_GAP))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        let bus_addr = state.next_bus;
        let next_bus = bus_addr
            .checked_add(span)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

        let virt = unsafe { alloc::alloc_zeroed(layout) };
        if virt.is_null() {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }

        let region = MemoryRegion {
            virt_addr: virt as usize,
            bus_addr,
            handle: state.next_handle,
            size,
        };
        state.next_handle += 1;
        state.next_bus = next_bus;
        state.buffers.insert(
            bus_addr,
            MockBuffer {
                region,
                layout,
                closed: false,
            },
        );
        Ok(region)
    }

    fn free_buffer(&self, region: &MemoryRegion) -> io::Result<()> {
        let mut state = self.state();
        let referenced = state
            .pending
            .iter()
            .any(|launch| launch.handles.contains(&region.handle));
        match state.buffers.get_mut(&region.bus_addr) {
            Some(buffer) if buffer.region == *region && !buffer.closed => {
                if referenced {
                    buffer.closed = true;
                    return Ok(());
                }
            }
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        if let Some(buffer) = state.buffers.remove(&region.bus_addr) {
            unsafe { alloc::dealloc(buffer.region.as_mut_ptr(), buffer.layout) };
        }
        Ok(())
    }

    fn submit_csd(&self, cfg: &[u32; 7], _coef: &[u32; 4], handles: &[u32]) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_submissions {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if !handles.iter().all(|h| state.has_handle(*h)) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }

        let kernel = state
            .identify(cfg[5])
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        if cfg[4] + 1 != kernel.granularity().units as u32 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        state.submissions.push(SubmitRecord {
            cfg: *cfg,
            handles: handles.to_vec(),
            kernel,
        });
        state.pending.push(Launch {
            kernel,
            unif_bus: cfg[6],
            handles: handles.to_vec(),
        });
        Ok(())
    }

    fn wait_bo(&self, handle: u32, _timeout_ns: u64) -> io::Result<()> {
        let mut state = self.state();
        state.waits.push(handle);
        if state.hang {
            return Err(io::Error::from_raw_os_error(libc::ETIME));
        }
        if !state.has_handle(handle) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }

        let pending = std::mem::take(&mut state.pending);
        let result = pending
            .into_iter()
            .try_for_each(|launch| state.execute(&launch));
        state.release_closed();
        result
    }
}

impl Drop for MockState {
    fn drop(&mut self) {
        for buffer in self.buffers.values() {
            unsafe { alloc::dealloc(buffer.region.as_mut_ptr(), buffer.layout) };
        }
    }
}

fn fault() -> io::Error {
    io::Error::from_raw_os_error(libc::EFAULT)
}

impl MockState {
    fn has_handle(&self, handle: u32) -> bool {
        self.buffers
            .values()
            .any(|b| !b.closed && b.region.handle == handle)
    }

    /// Deallocate closed buffers once no queued job can touch them.
    fn release_closed(&mut self) {
        let closed: Vec<u32> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.closed)
            .map(|(&bus, _)| bus)
            .collect();
        for bus in closed {
            if let Some(buffer) = self.buffers.remove(&bus) {
                unsafe { alloc::dealloc(buffer.region.as_mut_ptr(), buffer.layout) };
            }
        }
    }

    fn identify(&self, code_bus: u32) -> Option<KernelKind> {
        let code = self.host_ptr(code_bus, 1).ok()?;
        let (_, buffer) = self.buffers.range(..=code_bus).next_back()?;
        let available = (buffer.region.bus_addr as usize + buffer.region.size) - code_bus as usize;
        let bytes = unsafe { std::slice::from_raw_parts(code.cast_const(), available) };

        self.kernels
            .iter()
            .find(|(image, _)| bytes.starts_with(image))
            .map(|(_, kind)| *kind)
    }

    /// Host pointer for `[bus, bus + len)`, which must lie in one buffer.
    fn host_ptr(&self, bus: u32, len: usize) -> io::Result<*mut u8> {
        let (_, buffer) = self.buffers.range(..=bus).next_back().ok_or_else(fault)?;
        let offset = (bus - buffer.region.bus_addr) as usize;
        if offset + len > buffer.region.size {
            return Err(fault());
        }
        Ok(unsafe { buffer.region.as_mut_ptr().add(offset) })
    }

    fn read_u32(&self, bus: u32) -> io::Result<u32> {
        let p = self.host_ptr(bus, 4)?;
        Ok(unsafe { ptr::read_volatile(p.cast::<u32>()) })
    }

    fn read_f32(&self, bus: u32) -> io::Result<f32> {
        self.read_u32(bus).map(f32::from_bits)
    }

    fn write_f32(&self, bus: u32, value: f32) -> io::Result<()> {
        let p = self.host_ptr(bus, 4)?;
        unsafe { ptr::write_volatile(p.cast::<u32>(), value.to_bits()) };
        Ok(())
    }

    fn execute(&self, launch: &Launch) -> io::Result<()> {
        let mut u = [0u32; 11];
        for (i, word) in u.iter_mut().enumerate() {
            // Short uniform streams near the end of the buffer are fine.
            *word = self.read_u32(launch.unif_bus + 4 * i as u32).unwrap_or(0);
        }
        let f = f32::from_bits;
        let gran = launch.kernel.granularity();

        // The split dimension must be a whole number of passes.
        let bulk = if launch.kernel == KernelKind::SgemvT { u[1] } else { u[0] };
        if bulk % gran.align() as u32 != 0 {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }

        match launch.kernel {
            KernelKind::Saxpy => {
                let (n, a, x, incx, y, incy) = (u[0], f(u[1]), u[2], u[3], u[4], u[5]);
                for i in 0..n {
                    let (xi, yi) = (elem(x, i, incx)?, elem(y, i, incy)?);
                    self.write_f32(yi, self.read_f32(yi)? + a * self.read_f32(xi)?)?;
                }
            }
            KernelKind::Scopy => {
                let (n, x, incx, y, incy) = (u[0], u[1], u[2], u[3], u[4]);
                for i in 0..n {
                    self.write_f32(elem(y, i, incy)?, self.read_f32(elem(x, i, incx)?)?)?;
                }
            }
            KernelKind::Sscal => {
                let (n, a, x, incx) = (u[0], f(u[1]), u[2], u[3]);
                for i in 0..n {
                    let xi = elem(x, i, incx)?;
                    self.write_f32(xi, a * self.read_f32(xi)?)?;
                }
            }
            KernelKind::Sdot => {
                let (n, x, incx, y, incy, out) = (u[0], u[1], u[2], u[3], u[4], u[5]);
                self.reduce(n, gran.lanes(), out, |i| {
                    Ok(self.read_f32(elem(x, i, incx)?)? * self.read_f32(elem(y, i, incy)?)?)
                })?;
            }
            KernelKind::Snrm2 => {
                let (n, x, incx, out) = (u[0], u[1], u[2], u[3]);
                self.reduce(n, gran.lanes(), out, |i| {
                    let v = self.read_f32(elem(x, i, incx)?)?;
                    Ok(v * v)
                })?;
            }
            KernelKind::Sasum => {
                let (n, x, incx, out) = (u[0], u[1], u[2], u[3]);
                self.reduce(n, gran.lanes(), out, |i| {
                    Ok(self.read_f32(elem(x, i, incx)?)?.abs())
                })?;
            }
            KernelKind::SgemvN | KernelKind::SgemvT => {
                let trans = launch.kernel == KernelKind::SgemvT;
                let (m, n, alpha, a, lda) = (u[0], u[1], f(u[2]), u[3], u[4]);
                let (x, incx, beta, y, incy) = (u[5], u[6], f(u[7]), u[8], u[9]);
                let (outputs, inner) = if trans { (n, m) } else { (m, n) };
                for o in 0..outputs {
                    let mut acc = 0.0f32;
                    for p in 0..inner {
                        let (row, col) = if trans { (p, o) } else { (o, p) };
                        let aij = self.read_f32(elem(a, row * lda + col, 1)?)?;
                        acc += aij * self.read_f32(elem(x, p, incx)?)?;
                    }
                    let yo = elem(y, o, incy)?;
                    let value = if beta == 0.0 {
                        alpha * acc
                    } else {
                        alpha * acc + beta * self.read_f32(yo)?
                    };
                    self.write_f32(yo, value)?;
                }
            }
            KernelKind::SgemmRnn
            | KernelKind::SgemmRnt
            | KernelKind::SgemmRtn
            | KernelKind::SgemmRtt => {
                let trans_a = matches!(launch.kernel, KernelKind::SgemmRtn | KernelKind::SgemmRtt);
                let trans_b = matches!(launch.kernel, KernelKind::SgemmRnt | KernelKind::SgemmRtt);
                let (m, n, k, alpha) = (u[0], u[1], u[2], f(u[3]));
                let (a, lda, b, ldb) = (u[4], u[5], u[6], u[7]);
                let (beta, c, ldc) = (f(u[8]), u[9], u[10]);
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0.0f32;
                        for p in 0..k {
                            let ai = if trans_a { p * lda + i } else { i * lda + p };
                            let bi = if trans_b { j * ldb + p } else { p * ldb + j };
                            acc += self.read_f32(elem(a, ai, 1)?)? * self.read_f32(elem(b, bi, 1)?)?;
                        }
                        let cij = elem(c, i * ldc + j, 1)?;
                        let value = if beta == 0.0 {
                            alpha * acc
                        } else {
                            alpha * acc + beta * self.read_f32(cij)?
                        };
                        self.write_f32(cij, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Accumulate `term(i)` for `i < n` into `lanes` partials and store them at `out`.
    fn reduce(
        &self,
        n: u32,
        lanes: usize,
        out: u32,
        term: impl Fn(u32) -> io::Result<f32>,
    ) -> io::Result<()> {
        let mut partials = vec![0.0f32; lanes];
        for i in 0..n {
            partials[i as usize % lanes] += term(i)?;
        }
        for (lane, value) in partials.into_iter().enumerate() {
            self.write_f32(out + 4 * lane as u32, value)?;
        }
        Ok(())
    }
}

/// Bus address of element `index` of a strided `f32` vector.
fn elem(base: u32, index: u32, stride: u32) -> io::Result<u32> {
    u64::from(index)
        .checked_mul(u64::from(stride))
        .and_then(|i| i.checked_mul(4))
        .and_then(|off| u32::try_from(u64::from(base) + off).ok())
        .ok_or_else(fault)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_addresses_are_only_word_aligned() {
        let driver = MockDriver::new();
        let a = driver.alloc_buffer(100).unwrap();
        let b = driver.alloc_buffer(100).unwrap();
        assert_eq!(a.bus_addr % 4, 0);
        assert_ne!(a.bus_addr % 8, 0);
        assert!(b.bus_addr >= a.bus_addr + 100);
        assert_ne!(a.handle, b.handle);
        assert_eq!(driver.live_buffers(), 2);

        driver.free_buffer(&a).unwrap();
        assert!(driver.free_buffer(&a).is_err());
        driver.free_buffer(&b).unwrap();
        assert_eq!(driver.live_buffers(), 0);
    }

    #[test]
    fn jobs_run_only_when_waited_on() {
        let driver = MockDriver::new();
        let image = crate::runtime::kernels::placeholder_image(KernelKind::Scopy);
        let code = driver.alloc_buffer(image.len()).unwrap();
        unsafe { ptr::copy_nonoverlapping(image.as_ptr(), code.as_mut_ptr(), image.len()) };

        let n = KernelKind::Scopy.granularity().align();
        let x = driver.alloc_buffer(n * 4).unwrap();
        let y = driver.alloc_buffer(n * 4).unwrap();
        let unif = driver.alloc_buffer(64).unwrap();
        unsafe {
            let xs = std::slice::from_raw_parts_mut(x.as_mut_ptr().cast::<f32>(), n);
            xs.fill(3.0);
            let words = [n as u32, x.bus_addr, 1, y.bus_addr, 1];
            ptr::copy_nonoverlapping(words.as_ptr(), unif.as_mut_ptr().cast::<u32>(), 5);
        }

        let cfg = [0, 0, 0, 0, 7, code.bus_addr, unif.bus_addr];
        driver.submit_csd(&cfg, &[0; 4], &[y.handle]).unwrap();
        assert_eq!(driver.pending_jobs(), 1);
        assert_eq!(unsafe { ptr::read(y.as_mut_ptr().cast::<f32>()) }, 0.0);

        driver.wait_bo(y.handle, 0).unwrap();
        assert_eq!(driver.pending_jobs(), 0);
        let ys = unsafe { std::slice::from_raw_parts(y.as_mut_ptr().cast::<f32>(), n) };
        assert!(ys.iter().all(|&v| v == 3.0));
        assert_eq!(driver.submissions()[0].kernel, KernelKind::Scopy);
    }

    #[test]
    fn buffers_freed_under_a_queued_job_outlive_it() {
        let driver = MockDriver::new();
        let image = crate::runtime::kernels::placeholder_image(KernelKind::Scopy);
        let code = driver.alloc_buffer(image.len()).unwrap();
        unsafe { ptr::copy_nonoverlapping(image.as_ptr(), code.as_mut_ptr(), image.len()) };

        let n = KernelKind::Scopy.granularity().align();
        let x = driver.alloc_buffer(n * 4).unwrap();
        let y = driver.alloc_buffer(n * 4).unwrap();
        let unif = driver.alloc_buffer(64).unwrap();
        unsafe {
            let xs = std::slice::from_raw_parts_mut(x.as_mut_ptr().cast::<f32>(), n);
            xs.fill(5.0);
            let words = [n as u32, x.bus_addr, 1, y.bus_addr, 1];
            ptr::copy_nonoverlapping(words.as_ptr(), unif.as_mut_ptr().cast::<u32>(), 5);
        }

        let cfg = [0, 0, 0, 0, 7, code.bus_addr, unif.bus_addr];
        let handles = [x.handle, y.handle, unif.handle];
        driver.submit_csd(&cfg, &[0; 4], &handles).unwrap();

        driver.free_buffer(&x).unwrap();
        assert!(driver.free_buffer(&x).is_err());
        assert_eq!(driver.live_buffers(), 3);

        driver.wait_bo(y.handle, 0).unwrap();
        let ys = unsafe { std::slice::from_raw_parts(y.as_mut_ptr().cast::<f32>(), n) };
        assert!(ys.iter().all(|&v| v == 5.0));
        assert_eq!(driver.live_buffers(), 3);
        assert_eq!(driver.state().buffers.len(), 3);
    }

    #[test]
    fn unknown_code_and_wrong_batch_count_are_rejected() {
        let driver = MockDriver::new();
        let junk = driver.alloc_buffer(16).unwrap();
        let cfg = [0, 0, 0, 0, 7, junk.bus_addr, junk.bus_addr];
        assert!(driver.submit_csd(&cfg, &[0; 4], &[]).is_err());

        let image = crate::runtime::kernels::placeholder_image(KernelKind::Sdot);
        let code = driver.alloc_buffer(image.len()).unwrap();
        unsafe { ptr::copy_nonoverlapping(image.as_ptr(), code.as_mut_ptr(), image.len()) };
        let cfg = [0, 0, 0, 0, 3, code.bus_addr, junk.bus_addr];
        assert!(driver.submit_csd(&cfg, &[0; 4], &[]).is_err());
        assert!(driver.submissions().is_empty());
    }
}
