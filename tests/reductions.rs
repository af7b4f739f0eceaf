mod common;

use common::{DmaVec, mock_context, value};
use v3d_blas::{KernelKind, blas};

fn sizes(kind: KernelKind) -> Vec<usize> {
    let align = kind.granularity().align();
    vec![1, 100, align - 1, align, align + 1, 2 * align - 1]
}

/// Accumulation order differs from a sequential sum, so allow an error growing with `sqrt(n)`.
fn assert_close(got: f32, reference: f64, magnitude: f64, n: usize) {
    assert!(got.is_finite(), "non-finite result {got} for n={n}");
    let tolerance = 1e-5 * (n as f64).sqrt() * magnitude.max(1.0);
    let error = (f64::from(got) - reference).abs();
    assert!(
        error <= tolerance,
        "n={n}: got {got}, expected {reference} (error {error} > {tolerance})"
    );
}

#[test]
fn sdot_matches_double_precision_reference() {
    let (driver, ctx) = mock_context();

    for n in sizes(KernelKind::Sdot) {
        for (incx, incy) in [(1, 1), (2, 1)] {
            let x = DmaVec::from_fn(&ctx, (n - 1) * incx + 1, value);
            let y = DmaVec::from_fn(&ctx, (n - 1) * incy + 1, |i| value(i + 17));

            let terms: Vec<f64> = (0..n)
                .map(|i| f64::from(x[i * incx]) * f64::from(y[i * incy]))
                .collect();
            let reference: f64 = terms.iter().sum();
            let magnitude: f64 = terms.iter().map(|t| t.abs()).sum();

            let got = blas::sdot(&ctx, n as i32, &x, incx as i32, &y, incy as i32);
            assert_close(got, reference, magnitude, n);
        }
    }

    assert!(driver.submissions().iter().all(|s| s.kernel == KernelKind::Sdot));
    ctx.finalize().unwrap();
}

#[test]
fn snrm2_matches_double_precision_reference() {
    let (_, ctx) = mock_context();

    for n in sizes(KernelKind::Snrm2) {
        for incx in [1, 2] {
            let x = DmaVec::from_fn(&ctx, (n - 1) * incx + 1, value);
            let reference = (0..n)
                .map(|i| f64::from(x[i * incx]).powi(2))
                .sum::<f64>()
                .sqrt();

            let got = blas::snrm2(&ctx, n as i32, &x, incx as i32);
            assert_close(got, reference, reference, n);
        }
    }
    ctx.finalize().unwrap();
}

#[test]
fn sasum_matches_double_precision_reference() {
    let (_, ctx) = mock_context();

    for n in sizes(KernelKind::Sasum) {
        let x = DmaVec::from_fn(&ctx, 3 * (n - 1) + 1, value);
        let reference: f64 = (0..n).map(|i| f64::from(x[3 * i]).abs()).sum();

        let got = blas::sasum(&ctx, n as i32, &x, 3);
        assert_close(got, reference, reference, n);
    }
    ctx.finalize().unwrap();
}

#[test]
fn reductions_wait_on_the_uniform_buffer() {
    let (driver, ctx) = mock_context();
    let n = KernelKind::Sdot.granularity().align();
    let x = DmaVec::from_fn(&ctx, n, value);
    let y = DmaVec::from_fn(&ctx, n, value);

    let _ = blas::sdot(&ctx, n as i32, &x, 1, &y, 1);

    let x_handle = ctx.resolve(x.as_ptr().cast()).unwrap().handle;
    let y_handle = ctx.resolve(y.as_ptr().cast()).unwrap().handle;
    let waits = driver.waits();
    assert_eq!(waits.len(), 1);
    assert_ne!(waits[0], x_handle);
    assert_ne!(waits[0], y_handle);
    assert!(driver.submissions()[0].handles.contains(&waits[0]));

    drop((x, y));
    ctx.finalize().unwrap();
}
