#![allow(clippy::cast_possible_truncation)]

use crate::blas::{check_dim, check_inc, check_vector};
use crate::error::BlasResult;
use crate::runtime::context::Context;
use crate::runtime::kernels::KernelKind;
use crate::runtime::memory::DmaMemoryManager;
use crate::runtime::split::{self, SplitRoutine, Staged, resolve_operand, word};
use crate::runtime::uniform::{UniformBuffer, Uniforms};

/// Sum of the per-lane partials a reduction kernel left behind.
fn lane_sum(partials: Option<&[f32]>) -> f32 {
    partials.map_or(0.0, |p| p.iter().sum())
}

// ===============================================================================================
// scopy: y <- x
// ===============================================================================================

struct Scopy<'a> {
    n: usize,
    x: &'a [f32],
    incx: usize,
    y: &'a mut [f32],
    incy: usize,
}

impl SplitRoutine for Scopy<'_> {
    type Output = ();

    fn kernel(&self) -> KernelKind {
        KernelKind::Scopy
    }

    fn len(&self) -> usize {
        self.n
    }

    fn stage(&self, memory: &DmaMemoryManager, _: &UniformBuffer, bulk: usize) -> BlasResult<Staged> {
        let x = resolve_operand(memory, self.x)?;
        let y = resolve_operand(memory, &*self.y)?;
        let uniforms = Uniforms::new()
            .u32(word(1, "n", bulk)?)
            .u32(x.bus_addr)
            .u32(self.incx as u32)
            .u32(y.bus_addr)
            .u32(self.incy as u32);
        Ok(Staged::new(uniforms).reads(x).writes(y.handle))
    }

    fn host(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            self.y[i * self.incy] = self.x[i * self.incx];
        }
    }

    fn finish(self, _: Option<&[f32]>) {}
}

/// Copy `n` elements of `x` into `y`.
///
/// # Errors
/// Fails on a non-positive length or stride, a vector too short for them, or any
/// accelerator failure.
pub fn try_scopy(
    ctx: &Context,
    n: i32,
    x: &[f32],
    incx: i32,
    y: &mut [f32],
    incy: i32,
) -> BlasResult<()> {
    let n = check_dim(1, "n", n)?;
    let incx = check_inc(3, "incx", incx)?;
    let incy = check_inc(5, "incy", incy)?;
    check_vector(2, "x", x.len(), n, incx)?;
    check_vector(4, "y", y.len(), n, incy)?;

    split::execute(
        ctx,
        Scopy {
            n,
            x,
            incx,
            y,
            incy,
        },
    )
}

pub fn scopy(ctx: &Context, n: i32, x: &[f32], incx: i32, y: &mut [f32], incy: i32) {
    ctx.unwrap_or_fatal("scopy", try_scopy(ctx, n, x, incx, y, incy));
}

// ===============================================================================================
// sscal: x <- alpha * x
// ===============================================================================================

struct Sscal<'a> {
    n: usize,
    alpha: f32,
    x: &'a mut [f32],
    incx: usize,
}

impl SplitRoutine for Sscal<'_> {
    type Output = ();

    fn kernel(&self) -> KernelKind {
        KernelKind::Sscal
    }

    fn len(&self) -> usize {
        self.n
    }

    fn stage(&self, memory: &DmaMemoryManager, _: &UniformBuffer, bulk: usize) -> BlasResult<Staged> {
        let x = resolve_operand(memory, &*self.x)?;
        let uniforms = Uniforms::new()
            .u32(word(1, "n", bulk)?)
            .f32(self.alpha)
            .u32(x.bus_addr)
            .u32(self.incx as u32);
        Ok(Staged::new(uniforms).writes(x.handle))
    }

    fn host(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            self.x[i * self.incx] *= self.alpha;
        }
    }

    fn finish(self, _: Option<&[f32]>) {}
}

/// Scale `n` elements of `x` by `alpha` in place.
///
/// # Errors
/// See [`try_scopy`].
pub fn try_sscal(ctx: &Context, n: i32, alpha: f32, x: &mut [f32], incx: i32) -> BlasResult<()> {
    let n = check_dim(1, "n", n)?;
    let incx = check_inc(4, "incx", incx)?;
    check_vector(3, "x", x.len(), n, incx)?;

    split::execute(ctx, Sscal { n, alpha, x, incx })
}

pub fn sscal(ctx: &Context, n: i32, alpha: f32, x: &mut [f32], incx: i32) {
    ctx.unwrap_or_fatal("sscal", try_sscal(ctx, n, alpha, x, incx));
}

// ===============================================================================================
// saxpy: y <- alpha * x + y
// ===============================================================================================

struct Saxpy<'a> {
    n: usize,
    alpha: f32,
    x: &'a [f32],
    incx: usize,
    y: &'a mut [f32],
    incy: usize,
}

impl SplitRoutine for Saxpy<'_> {
    type Output = ();

    fn kernel(&self) -> KernelKind {
        KernelKind::Saxpy
    }

    fn len(&self) -> usize {
        self.n
    }

    fn stage(&self, memory: &DmaMemoryManager, _: &UniformBuffer, bulk: usize) -> BlasResult<Staged> {
        let x = resolve_operand(memory, self.x)?;
        let y = resolve_operand(memory, &*self.y)?;
        let uniforms = Uniforms::new()
            .u32(word(1, "n", bulk)?)
            .f32(self.alpha)
            .u32(x.bus_addr)
            .u32(self.incx as u32)
            .u32(y.bus_addr)
            .u32(self.incy as u32);
        Ok(Staged::new(uniforms).reads(x).writes(y.handle))
    }

    fn host(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            self.y[i * self.incy] += self.alpha * self.x[i * self.incx];
        }
    }

    fn finish(self, _: Option<&[f32]>) {}
}

/// Add `alpha * x` to `y` over `n` elements.
///
/// # Errors
/// See [`try_scopy`].
pub fn try_saxpy(
    ctx: &Context,
    n: i32,
    alpha: f32,
    x: &[f32],
    incx: i32,
    y: &mut [f32],
    incy: i32,
) -> BlasResult<()> {
    let n = check_dim(1, "n", n)?;
    let incx = check_inc(4, "incx", incx)?;
    let incy = check_inc(6, "incy", incy)?;
    check_vector(3, "x", x.len(), n, incx)?;
    check_vector(5, "y", y.len(), n, incy)?;

    split::execute(
        ctx,
        Saxpy {
            n,
            alpha,
            x,
            incx,
            y,
            incy,
        },
    )
}

pub fn saxpy(ctx: &Context, n: i32, alpha: f32, x: &[f32], incx: i32, y: &mut [f32], incy: i32) {
    ctx.unwrap_or_fatal("saxpy", try_saxpy(ctx, n, alpha, x, incx, y, incy));
}

// ===============================================================================================
// sdot: x . y
// ===============================================================================================

struct Sdot<'a> {
    n: usize,
    x: &'a [f32],
    incx: usize,
    y: &'a [f32],
    incy: usize,
    acc: f32,
}

impl SplitRoutine for Sdot<'_> {
    type Output = f32;

    fn kernel(&self) -> KernelKind {
        KernelKind::Sdot
    }

    fn len(&self) -> usize {
        self.n
    }

    fn stage(
        &self,
        memory: &DmaMemoryManager,
        unif: &UniformBuffer,
        bulk: usize,
    ) -> BlasResult<Staged> {
        let x = resolve_operand(memory, self.x)?;
        let y = resolve_operand(memory, self.y)?;
        let uniforms = Uniforms::new()
            .u32(word(1, "n", bulk)?)
            .u32(x.bus_addr)
            .u32(self.incx as u32)
            .u32(y.bus_addr)
            .u32(self.incy as u32)
            .u32(unif.bus_addr());
        Ok(Staged::new(uniforms)
            .reads(x)
            .reads(y)
            .writes(unif.handle()))
    }

    fn host(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            self.acc += self.x[i * self.incx] * self.y[i * self.incy];
        }
    }

    fn finish(self, partials: Option<&[f32]>) -> f32 {
        lane_sum(partials) + self.acc
    }
}

/// Dot product of `n` elements of `x` and `y`.
///
/// Lane partials are summed in an unspecified order, so results may differ in the last
/// bits from a sequential sum.
///
/// # Errors
/// See [`try_scopy`].
pub fn try_sdot(
    ctx: &Context,
    n: i32,
    x: &[f32],
    incx: i32,
    y: &[f32],
    incy: i32,
) -> BlasResult<f32> {
    let n = check_dim(1, "n", n)?;
    let incx = check_inc(3, "incx", incx)?;
    let incy = check_inc(5, "incy", incy)?;
    check_vector(2, "x", x.len(), n, incx)?;
    check_vector(4, "y", y.len(), n, incy)?;

    split::execute(
        ctx,
        Sdot {
            n,
            x,
            incx,
            y,
            incy,
            acc: 0.0,
        },
    )
}

#[must_use]
pub fn sdot(ctx: &Context, n: i32, x: &[f32], incx: i32, y: &[f32], incy: i32) -> f32 {
    ctx.unwrap_or_fatal("sdot", try_sdot(ctx, n, x, incx, y, incy))
}

// ===============================================================================================
// snrm2 / sasum: single-vector reductions
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Norm {
    Euclidean,
    AbsSum,
}

struct VectorNorm<'a> {
    norm: Norm,
    n: usize,
    x: &'a [f32],
    incx: usize,
    acc: f32,
}

impl SplitRoutine for VectorNorm<'_> {
    type Output = f32;

    fn kernel(&self) -> KernelKind {
        match self.norm {
            Norm::Euclidean => KernelKind::Snrm2,
            Norm::AbsSum => KernelKind::Sasum,
        }
    }

    fn len(&self) -> usize {
        self.n
    }

    fn stage(
        &self,
        memory: &DmaMemoryManager,
        unif: &UniformBuffer,
        bulk: usize,
    ) -> BlasResult<Staged> {
        let x = resolve_operand(memory, self.x)?;
        let uniforms = Uniforms::new()
            .u32(word(1, "n", bulk)?)
            .u32(x.bus_addr)
            .u32(self.incx as u32)
            .u32(unif.bus_addr());
        Ok(Staged::new(uniforms).reads(x).writes(unif.handle()))
    }

    fn host(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            let v = self.x[i * self.incx];
            self.acc += match self.norm {
                Norm::Euclidean => v * v,
                Norm::AbsSum => v.abs(),
            };
        }
    }

    fn finish(self, partials: Option<&[f32]>) -> f32 {
        let total = lane_sum(partials) + self.acc;
        match self.norm {
            Norm::Euclidean => total.sqrt(),
            Norm::AbsSum => total,
        }
    }
}

fn try_norm(ctx: &Context, norm: Norm, n: i32, x: &[f32], incx: i32) -> BlasResult<f32> {
    let n = check_dim(1, "n", n)?;
    let incx = check_inc(3, "incx", incx)?;
    check_vector(2, "x", x.len(), n, incx)?;

    split::execute(
        ctx,
        VectorNorm {
            norm,
            n,
            x,
            incx,
            acc: 0.0,
        },
    )
}

/// Euclidean norm of `n` elements of `x`.
///
/// # Errors
/// See [`try_scopy`].
pub fn try_snrm2(ctx: &Context, n: i32, x: &[f32], incx: i32) -> BlasResult<f32> {
    try_norm(ctx, Norm::Euclidean, n, x, incx)
}

#[must_use]
pub fn snrm2(ctx: &Context, n: i32, x: &[f32], incx: i32) -> f32 {
    ctx.unwrap_or_fatal("snrm2", try_snrm2(ctx, n, x, incx))
}

/// Sum of absolute values of `n` elements of `x`.
///
/// # Errors
/// See [`try_scopy`].
pub fn try_sasum(ctx: &Context, n: i32, x: &[f32], incx: i32) -> BlasResult<f32> {
    try_norm(ctx, Norm::AbsSum, n, x, incx)
}

#[must_use]
pub fn sasum(ctx: &Context, n: i32, x: &[f32], incx: i32) -> f32 {
    ctx.unwrap_or_fatal("sasum", try_sasum(ctx, n, x, incx))
}
