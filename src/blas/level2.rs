#![allow(clippy::cast_possible_truncation)]

use crate::blas::{Layout, Transpose, check_dim, check_inc, check_matrix, check_vector};
use crate::error::BlasResult;
use crate::runtime::context::Context;
use crate::runtime::kernels::KernelKind;
use crate::runtime::memory::DmaMemoryManager;
use crate::runtime::split::{self, SplitRoutine, Staged, resolve_operand, word};
use crate::runtime::uniform::{UniformBuffer, Uniforms};

/// `y <- alpha * op(A) * x + beta * y` over a row-major `rows × cols` matrix.
///
/// The split runs over the outputs: rows of `A` without transposition, columns with.
struct Sgemv<'a> {
    trans: Transpose,
    rows: usize,
    cols: usize,
    alpha: f32,
    a: &'a [f32],
    lda: usize,
    x: &'a [f32],
    incx: usize,
    beta: f32,
    y: &'a mut [f32],
    incy: usize,
}

impl SplitRoutine for Sgemv<'_> {
    type Output = ();

    fn kernel(&self) -> KernelKind {
        match self.trans {
            Transpose::NoTrans => KernelKind::SgemvN,
            Transpose::Trans => KernelKind::SgemvT,
        }
    }

    fn len(&self) -> usize {
        match self.trans {
            Transpose::NoTrans => self.rows,
            Transpose::Trans => self.cols,
        }
    }

    fn stage(&self, memory: &DmaMemoryManager, _: &UniformBuffer, bulk: usize) -> BlasResult<Staged> {
        let (rows, cols) = match self.trans {
            Transpose::NoTrans => (bulk, self.cols),
            Transpose::Trans => (self.rows, bulk),
        };
        let a = resolve_operand(memory, self.a)?;
        let x = resolve_operand(memory, self.x)?;
        let y = resolve_operand(memory, &*self.y)?;

        let uniforms = Uniforms::new()
            .u32(word(3, "m", rows)?)
            .u32(word(4, "n", cols)?)
            .f32(self.alpha)
            .u32(a.bus_addr)
            .u32(self.lda as u32)
            .u32(x.bus_addr)
            .u32(self.incx as u32)
            .f32(self.beta)
            .u32(y.bus_addr)
            .u32(self.incy as u32);
        Ok(Staged::new(uniforms).reads(a).reads(x).writes(y.handle))
    }

    fn host(&mut self, start: usize, count: usize) {
        let inner = match self.trans {
            Transpose::NoTrans => self.cols,
            Transpose::Trans => self.rows,
        };
        for o in start..start + count {
            let mut acc = 0.0f32;
            for p in 0..inner {
                let aij = match self.trans {
                    Transpose::NoTrans => self.a[o * self.lda + p],
                    Transpose::Trans => self.a[p * self.lda + o],
                };
                acc += aij * self.x[p * self.incx];
            }

            let yo = &mut self.y[o * self.incy];
            *yo = if self.beta == 0.0 {
                self.alpha * acc
            } else {
                self.alpha * acc + self.beta * *yo
            };
        }
    }

    fn finish(self, _: Option<&[f32]>) {}
}

/// Matrix-vector product `y <- alpha * op(A) * x + beta * y` for an `m × n` matrix `A`.
///
/// With `beta == 0`, `y` is only written, never read.
///
/// # Errors
/// Fails on a non-positive dimension or stride, a leading dimension smaller than the
/// stored row (or column) length, an operand too short, or any accelerator failure.
#[allow(clippy::too_many_arguments)]
pub fn try_sgemv(
    ctx: &Context,
    layout: Layout,
    trans: Transpose,
    m: i32,
    n: i32,
    alpha: f32,
    a: &[f32],
    lda: i32,
    x: &[f32],
    incx: i32,
    beta: f32,
    y: &mut [f32],
    incy: i32,
) -> BlasResult<()> {
    let m = check_dim(3, "m", m)?;
    let n = check_dim(4, "n", n)?;
    let lda = check_matrix((6, 7), ("a", "lda"), a.len(), layout, (m, n), lda)?;
    let incx = check_inc(9, "incx", incx)?;
    let incy = check_inc(12, "incy", incy)?;
    let (x_len, y_len) = trans.stored(n, m);
    check_vector(8, "x", x.len(), x_len, incx)?;
    check_vector(11, "y", y.len(), y_len, incy)?;

    // A column-major matrix is the row-major storage of its transpose.
    let (trans, rows, cols) = match layout {
        Layout::RowMajor => (trans, m, n),
        Layout::ColMajor => (trans.flip(), n, m),
    };

    split::execute(
        ctx,
        Sgemv {
            trans,
            rows,
            cols,
            alpha,
            a,
            lda,
            x,
            incx,
            beta,
            y,
            incy,
        },
    )
}

#[allow(clippy::too_many_arguments)]
pub fn sgemv(
    ctx: &Context,
    layout: Layout,
    trans: Transpose,
    m: i32,
    n: i32,
    alpha: f32,
    a: &[f32],
    lda: i32,
    x: &[f32],
    incx: i32,
    beta: f32,
    y: &mut [f32],
    incy: i32,
) {
    ctx.unwrap_or_fatal(
        "sgemv",
        try_sgemv(
            ctx, layout, trans, m, n, alpha, a, lda, x, incx, beta, y, incy,
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::mock::MockDriver;
    use crate::runtime::{KernelLibrary, RuntimeConfig};

    #[test]
    fn small_products_in_both_layouts() {
        let ctx = Context::new(
            MockDriver::new(),
            &KernelLibrary::placeholder(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        // [[1, 2, 3], [4, 5, 6]] row-major, and the same matrix column-major.
        let row: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let col: [f32; 6] = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];

        for (layout, a, lda) in [(Layout::RowMajor, &row, 3), (Layout::ColMajor, &col, 2)] {
            let mut y = [f32::NAN; 2];
            let x: [f32; 3] = [1.0, 1.0, 1.0];
            try_sgemv(
                &ctx,
                layout,
                Transpose::NoTrans,
                2,
                3,
                1.0,
                a,
                lda,
                &x,
                1,
                0.0,
                &mut y,
                1,
            )
            .unwrap();
            assert_eq!(y, [6.0, 15.0], "{layout:?}");

            let mut y = [1.0f32; 3];
            let x: [f32; 2] = [1.0, -1.0];
            try_sgemv(
                &ctx,
                layout,
                Transpose::Trans,
                2,
                3,
                2.0,
                a,
                lda,
                &x,
                1,
                1.0,
                &mut y,
                1,
            )
            .unwrap();
            assert_eq!(y, [-5.0, -5.0, -5.0], "{layout:?}");
        }

        ctx.finalize().unwrap();
    }
}
