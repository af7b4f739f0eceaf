//! Runs saxpy on a real V3D device.
//!
//! Usage: `saxpy_device <kernel-dir> [n]`, where `<kernel-dir>` holds `saxpy.bin` and
//! optionally the other kernel images.

use std::path::PathBuf;
use std::slice;
use v3d_blas::{Context, KernelLibrary, RuntimeConfig, blas, support};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let dir = PathBuf::from(args.next().ok_or("usage: saxpy_device <kernel-dir> [n]")?);
    let n: usize = args.next().map(|s| s.parse::<usize>()).transpose()?.unwrap_or(1 << 20);

    println!("=== saxpy on V3D ===");

    // 1. Kernel images
    let library = KernelLibrary::from_dir(&dir)?;
    println!("[+] Loaded {} kernel images from {}", library.len(), dir.display());

    // 2. Device and runtime
    let ctx = Context::open(&library, &RuntimeConfig::from_env())?;
    println!("[+] Context ready: {ctx:?}");

    // 3. Operands in DMA memory
    let x_ptr = support::try_malloc(&ctx, n * size_of::<f32>(), 4096)?;
    let y_ptr = support::try_malloc(&ctx, n * size_of::<f32>(), 4096)?;
    let x = unsafe { slice::from_raw_parts_mut(x_ptr.as_ptr().cast::<f32>(), n) };
    let y = unsafe { slice::from_raw_parts_mut(y_ptr.as_ptr().cast::<f32>(), n) };
    for (i, (xi, yi)) in x.iter_mut().zip(y.iter_mut()).enumerate() {
        *xi = i as f32;
        *yi = 1.0;
    }

    // 4. y <- 2x + y
    let start = support::seconds();
    blas::try_saxpy(&ctx, i32::try_from(n)?, 2.0, x, 1, y, 1)?;
    let elapsed = support::seconds() - start;

    let wrong = (0..n).filter(|&i| y[i] != 2.0 * i as f32 + 1.0).count();
    println!(
        "[+] n = {n}: {:.3} ms, {:.1} MFLOP/s, {wrong} mismatches",
        elapsed * 1e3,
        2.0 * n as f64 / elapsed / 1e6
    );

    // 5. Cleanup
    support::try_free(&ctx, x_ptr.as_ptr())?;
    support::try_free(&ctx, y_ptr.as_ptr())?;
    ctx.finalize()?;
    println!("[+] Released all device memory");

    Ok(())
}
