#![allow(clippy::cast_possible_truncation)]

use crate::blas::{Layout, Transpose, check_dim, check_matrix};
use crate::error::BlasResult;
use crate::runtime::context::Context;
use crate::runtime::kernels::KernelKind;
use crate::runtime::memory::DmaMemoryManager;
use crate::runtime::split::{self, SplitRoutine, Staged, resolve_operand, word};
use crate::runtime::uniform::{UniformBuffer, Uniforms};

/// Row-major `C <- alpha * op(A) * op(B) + beta * C`, split over the rows of `C`.
struct Sgemm<'a> {
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &'a [f32],
    lda: usize,
    b: &'a [f32],
    ldb: usize,
    beta: f32,
    c: &'a mut [f32],
    ldc: usize,
}

impl Sgemm<'_> {
    fn a(&self, i: usize, p: usize) -> f32 {
        match self.trans_a {
            Transpose::NoTrans => self.a[i * self.lda + p],
            Transpose::Trans => self.a[p * self.lda + i],
        }
    }

    fn b(&self, p: usize, j: usize) -> f32 {
        match self.trans_b {
            Transpose::NoTrans => self.b[p * self.ldb + j],
            Transpose::Trans => self.b[j * self.ldb + p],
        }
    }
}

impl SplitRoutine for Sgemm<'_> {
    type Output = ();

    fn kernel(&self) -> KernelKind {
        match (self.trans_a, self.trans_b) {
            (Transpose::NoTrans, Transpose::NoTrans) => KernelKind::SgemmRnn,
            (Transpose::NoTrans, Transpose::Trans) => KernelKind::SgemmRnt,
            (Transpose::Trans, Transpose::NoTrans) => KernelKind::SgemmRtn,
            (Transpose::Trans, Transpose::Trans) => KernelKind::SgemmRtt,
        }
    }

    fn len(&self) -> usize {
        self.m
    }

    fn stage(&self, memory: &DmaMemoryManager, _: &UniformBuffer, bulk: usize) -> BlasResult<Staged> {
        let a = resolve_operand(memory, self.a)?;
        let b = resolve_operand(memory, self.b)?;
        let c = resolve_operand(memory, &*self.c)?;

        let uniforms = Uniforms::new()
            .u32(word(4, "m", bulk)?)
            .u32(word(5, "n", self.n)?)
            .u32(word(6, "k", self.k)?)
            .f32(self.alpha)
            .u32(a.bus_addr)
            .u32(self.lda as u32)
            .u32(b.bus_addr)
            .u32(self.ldb as u32)
            .f32(self.beta)
            .u32(c.bus_addr)
            .u32(self.ldc as u32);
        Ok(Staged::new(uniforms).reads(a).reads(b).writes(c.handle))
    }

    fn host(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            for j in 0..self.n {
                let acc: f32 = (0..self.k).map(|p| self.a(i, p) * self.b(p, j)).sum();
                let cij = i * self.ldc + j;
                self.c[cij] = if self.beta == 0.0 {
                    self.alpha * acc
                } else {
                    self.alpha * acc + self.beta * self.c[cij]
                };
            }
        }
    }

    fn finish(self, _: Option<&[f32]>) {}
}

/// Matrix product `C <- alpha * op(A) * op(B) + beta * C` with `C` of `m × n` and an
/// inner dimension `k`.
///
/// With `beta == 0`, `C` is only written, never read.
///
/// # Errors
/// Fails on a non-positive dimension, a leading dimension smaller than the stored row
/// (or column) length, an operand too short, or any accelerator failure.
#[allow(clippy::too_many_arguments)]
pub fn try_sgemm(
    ctx: &Context,
    layout: Layout,
    trans_a: Transpose,
    trans_b: Transpose,
    m: i32,
    n: i32,
    k: i32,
    alpha: f32,
    a: &[f32],
    lda: i32,
    b: &[f32],
    ldb: i32,
    beta: f32,
    c: &mut [f32],
    ldc: i32,
) -> BlasResult<()> {
    let m = check_dim(4, "m", m)?;
    let n = check_dim(5, "n", n)?;
    let k = check_dim(6, "k", k)?;
    let lda = check_matrix((8, 9), ("a", "lda"), a.len(), layout, trans_a.stored(m, k), lda)?;
    let ldb = check_matrix((10, 11), ("b", "ldb"), b.len(), layout, trans_b.stored(k, n), ldb)?;
    let ldc = check_matrix((13, 14), ("c", "ldc"), c.len(), layout, (m, n), ldc)?;

    // Column-major C is row-major C^T = op(B)^T * op(A)^T.
    let routine = match layout {
        Layout::RowMajor => Sgemm {
            trans_a,
            trans_b,
            m,
            n,
            k,
            alpha,
            a,
            lda,
            b,
            ldb,
            beta,
            c,
            ldc,
        },
        Layout::ColMajor => Sgemm {
            trans_a: trans_b,
            trans_b: trans_a,
            m: n,
            n: m,
            k,
            alpha,
            a: b,
            lda: ldb,
            b: a,
            ldb: lda,
            beta,
            c,
            ldc,
        },
    };
    split::execute(ctx, routine)
}

#[allow(clippy::too_many_arguments)]
pub fn sgemm(
    ctx: &Context,
    layout: Layout,
    trans_a: Transpose,
    trans_b: Transpose,
    m: i32,
    n: i32,
    k: i32,
    alpha: f32,
    a: &[f32],
    lda: i32,
    b: &[f32],
    ldb: i32,
    beta: f32,
    c: &mut [f32],
    ldc: i32,
) {
    ctx.unwrap_or_fatal(
        "sgemm",
        try_sgemm(
            ctx, layout, trans_a, trans_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc,
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::mock::MockDriver;
    use crate::runtime::{KernelLibrary, RuntimeConfig};

    #[test]
    fn column_major_matches_row_major_of_the_transpose() {
        let ctx = Context::new(
            MockDriver::new(),
            &KernelLibrary::placeholder(),
            &RuntimeConfig::default(),
        )
        .unwrap();

        // A = [[1, 2], [3, 4], [5, 6]] (3 × 2), B = [[1, 0, 2], [0, 1, 3]] (2 × 3).
        let a_row: [f32; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b_row: [f32; 6] = [1.0, 0.0, 2.0, 0.0, 1.0, 3.0];
        let expected: [f32; 9] = [1.0, 2.0, 8.0, 3.0, 4.0, 18.0, 5.0, 6.0, 28.0];

        let mut c = [f32::NAN; 9];
        try_sgemm(
            &ctx,
            Layout::RowMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            3,
            3,
            2,
            1.0,
            &a_row,
            2,
            &b_row,
            3,
            0.0,
            &mut c,
            3,
        )
        .unwrap();
        assert_eq!(c, expected);

        let a_col: [f32; 6] = [1.0, 3.0, 5.0, 2.0, 4.0, 6.0];
        let b_col: [f32; 6] = [1.0, 0.0, 0.0, 1.0, 2.0, 3.0];
        let mut c = [0.0f32; 9];
        try_sgemm(
            &ctx,
            Layout::ColMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            3,
            3,
            2,
            1.0,
            &a_col,
            3,
            &b_col,
            2,
            0.0,
            &mut c,
            3,
        )
        .unwrap();
        // Column-major storage of the same product.
        let transposed: Vec<f32> = (0..9).map(|i| expected[(i % 3) * 3 + i / 3]).collect();
        assert_eq!(c.to_vec(), transposed);

        ctx.finalize().unwrap();
    }
}
