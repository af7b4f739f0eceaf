use crate::drm::Driver;
use crate::error::{BlasError, BlasResult};
use crate::runtime::kernels::KernelKind;
use crate::runtime::memory::{DmaMemoryManager, MemoryRegion};
use std::io;
use std::ptr;

/// Words in the longest uniform layout (`sgemm`).
const MAX_LAYOUT_WORDS: usize = 11;

/// Most per-lane partials any reduction kernel writes back.
const fn max_partials() -> usize {
    let mut max = 0;
    let mut i = 0;
    while i < KernelKind::ALL.len() {
        let lanes = KernelKind::ALL[i].granularity().lanes();
        if lanes > max {
            max = lanes;
        }
        i += 1;
    }
    max
}

/// Parameter words for one kernel launch, in the order the kernel reads them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uniforms {
    words: Vec<u32>,
}

impl Uniforms {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn u32(mut self, value: u32) -> Self {
        self.words.push(value);
        self
    }

    /// Pushes the IEEE-754 bit pattern of `value`, not a numeric conversion.
    #[must_use]
    pub fn f32(mut self, value: f32) -> Self {
        self.words.push(value.to_bits());
        self
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.words
    }
}

/// The shared scratch region carrying kernel parameters in and, for reductions,
/// per-lane partial results out.
///
/// Only one job may use it at a time.
#[derive(Debug)]
pub struct UniformBuffer {
    region: MemoryRegion,
    words: usize,
}

impl UniformBuffer {
    /// Smallest buffer every kernel can read its parameters from and write partials to.
    pub const MIN_WORDS: usize = if MAX_LAYOUT_WORDS > max_partials() {
        MAX_LAYOUT_WORDS
    } else {
        max_partials()
    };

    /// # Errors
    /// Returns `UniformOverflow` if `words` is below [`Self::MIN_WORDS`], and
    /// `Allocation` if its byte size overflows or the driver refuses it.
    pub fn allocate(
        memory: &mut DmaMemoryManager,
        driver: &dyn Driver,
        words: usize,
    ) -> BlasResult<Self> {
        if words < Self::MIN_WORDS {
            return Err(BlasError::UniformOverflow {
                needed: Self::MIN_WORDS,
                capacity: words,
            });
        }
        let size = words
            .checked_mul(size_of::<u32>())
            .ok_or_else(|| BlasError::Allocation {
                size: usize::MAX,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            })?;

        let region = memory.allocate(driver, size)?;
        Ok(Self { region, words })
    }

    pub fn release(self, memory: &mut DmaMemoryManager, driver: &dyn Driver) -> BlasResult<()> {
        memory.free(driver, self.region.virt_addr)
    }

    #[must_use]
    pub const fn bus_addr(&self) -> u32 {
        self.region.bus_addr
    }

    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.region.handle
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.words
    }

    /// Store `uniforms` at the start of the buffer.
    pub fn load(&self, uniforms: &Uniforms) -> BlasResult<()> {
        let words = uniforms.as_slice();
        if words.len() > self.words {
            return Err(BlasError::UniformOverflow {
                needed: words.len(),
                capacity: self.words,
            });
        }

        let base = self.region.as_mut_ptr().cast::<u32>();
        for (i, &word) in words.iter().enumerate() {
            unsafe { ptr::write_volatile(base.add(i), word) };
        }
        Ok(())
    }

    /// Read back the first `count` words as `f32` partials.
    ///
    /// Only meaningful after the job writing them has been waited on.
    pub fn partials(&self, count: usize) -> BlasResult<Vec<f32>> {
        if count > self.words {
            return Err(BlasError::UniformOverflow {
                needed: count,
                capacity: self.words,
            });
        }

        let base = self.region.as_mut_ptr().cast::<u32>().cast_const();
        Ok((0..count)
            .map(|i| f32::from_bits(unsafe { ptr::read_volatile(base.add(i)) }))
            .collect())
    }
}
