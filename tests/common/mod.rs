#![allow(dead_code)]

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use v3d_blas::drm::mock::MockDriver;
use v3d_blas::{Context, KernelLibrary, RuntimeConfig, support};

pub fn panic_exit(code: i32) -> ! {
    panic!("exit({code})")
}

/// A context over a fresh mock device whose fatal errors panic instead of exiting.
pub fn mock_context() -> (MockDriver, Context) {
    let driver = MockDriver::new();
    let config = RuntimeConfig::default().with_exit_handler(panic_exit);
    let ctx = Context::new(driver.clone(), &KernelLibrary::placeholder(), &config)
        .expect("mock context");
    (driver, ctx)
}

/// `f32` storage in DMA memory, freed on drop.
pub struct DmaVec<'c> {
    ctx: &'c Context,
    ptr: NonNull<f32>,
    len: usize,
}

impl<'c> DmaVec<'c> {
    pub fn zeros(ctx: &'c Context, len: usize) -> Self {
        let ptr = support::try_calloc(ctx, len, size_of::<f32>(), 32).expect("calloc");
        Self {
            ctx,
            ptr: ptr.cast(),
            len,
        }
    }

    pub fn from_slice(ctx: &'c Context, data: &[f32]) -> Self {
        let mut v = Self::zeros(ctx, data.len());
        v.copy_from_slice(data);
        v
    }

    pub fn from_fn(ctx: &'c Context, len: usize, f: impl FnMut(usize) -> f32) -> Self {
        let data: Vec<f32> = (0..len).map(f).collect();
        Self::from_slice(ctx, &data)
    }
}

impl Deref for DmaVec<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for DmaVec<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DmaVec<'_> {
    fn drop(&mut self) {
        let _ = support::try_free(self.ctx, self.ptr.as_ptr().cast());
    }
}

/// A deterministic, non-trivial test value for index `i`.
pub fn value(i: usize) -> f32 {
    ((i * 37 + 11) % 101) as f32 / 16.0 - 3.0
}
