#![allow(clippy::cast_precision_loss)]

//! Aligned DMA allocation for operands, and a monotonic clock.
//!
//! Memory returned here is shared with the accelerator: the *bus* address of the
//! returned pointer is aligned, which is what the kernels require.

use crate::error::{BlasError, BlasResult};
use crate::runtime::context::Context;
use std::io;
use std::ptr::{self, NonNull};

/// Allocate `size` bytes whose bus address is a multiple of `alignment`.
///
/// An `alignment` that is not a positive power of two is silently replaced by the
/// context's default alignment.
///
/// # Errors
/// Returns `Allocation` if the driver cannot provide the memory.
pub fn try_malloc(ctx: &Context, size: usize, alignment: i32) -> BlasResult<NonNull<u8>> {
    let mut memory = ctx.memory.borrow_mut();
    ctx.aligned
        .borrow_mut()
        .allocate(&mut memory, ctx.driver(), size, alignment)
}

pub fn malloc(ctx: &Context, size: usize, alignment: i32) -> NonNull<u8> {
    ctx.unwrap_or_fatal("malloc", try_malloc(ctx, size, alignment))
}

/// Like [`try_malloc`] for `count` elements of `size` bytes, zero-filled.
///
/// # Errors
/// Returns `Allocation` if the total size overflows or the driver fails.
pub fn try_calloc(
    ctx: &Context,
    count: usize,
    size: usize,
    alignment: i32,
) -> BlasResult<NonNull<u8>> {
    let total = count
        .checked_mul(size)
        .ok_or_else(|| BlasError::Allocation {
            size: usize::MAX,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        })?;

    let ptr = try_malloc(ctx, total, alignment)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
    Ok(ptr)
}

pub fn calloc(ctx: &Context, count: usize, size: usize, alignment: i32) -> NonNull<u8> {
    ctx.unwrap_or_fatal("calloc", try_calloc(ctx, count, size, alignment))
}

/// Release memory from [`malloc`] or [`calloc`]. A null pointer is ignored.
///
/// # Errors
/// Returns `UnknownAlignedPointer` for a pointer that is not live, including one
/// already freed.
pub fn try_free(ctx: &Context, ptr: *mut u8) -> BlasResult<()> {
    let Some(ptr) = NonNull::new(ptr) else {
        return Ok(());
    };
    let mut memory = ctx.memory.borrow_mut();
    ctx.aligned
        .borrow_mut()
        .free(&mut memory, ctx.driver(), ptr)
}

pub fn free(ctx: &Context, ptr: *mut u8) {
    ctx.unwrap_or_fatal("free", try_free(ctx, ptr));
}

/// Seconds on the monotonic clock, for timing routines.
#[must_use]
pub fn seconds() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        log::warn!("clock_gettime: {}", io::Error::last_os_error());
        return 0.0;
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::mock::MockDriver;
    use crate::runtime::{KernelLibrary, RuntimeConfig};

    #[test]
    fn calloc_zeroes_and_free_accepts_null() {
        let ctx = Context::new(
            MockDriver::new(),
            &KernelLibrary::new(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        let ptr = try_calloc(&ctx, 16, 4, 64).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(ctx.resolve(ptr.as_ptr()).unwrap().bus_addr % 64, 0);

        try_free(&ctx, ptr::null_mut()).unwrap();
        try_free(&ctx, ptr.as_ptr()).unwrap();
        assert!(try_free(&ctx, ptr.as_ptr()).is_err());
        ctx.finalize().unwrap();
    }

    #[test]
    fn overflowing_calloc_fails() {
        let ctx = Context::new(
            MockDriver::new(),
            &KernelLibrary::new(),
            &RuntimeConfig::default(),
        )
        .unwrap();
        assert!(try_calloc(&ctx, usize::MAX, 2, 32).is_err());
        ctx.finalize().unwrap();
    }

    #[test]
    fn clock_is_monotonic() {
        let a = seconds();
        let b = seconds();
        assert!(a > 0.0);
        assert!(b >= a);
    }
}
