mod common;

use common::{DmaVec, mock_context, panic_exit, value};
use std::time::Duration;
use v3d_blas::drm::mock::MockDriver;
use v3d_blas::{BlasError, Context, ErrorKind, KernelKind, KernelLibrary, RuntimeConfig, blas, support};

#[test]
fn finalize_reports_unfreed_allocations() {
    let (driver, ctx) = mock_context();
    let _leaked = support::malloc(&ctx, 128, 32);
    let kept = support::malloc(&ctx, 128, 32);
    support::free(&ctx, kept.as_ptr());

    let err = ctx.finalize().unwrap_err();
    assert!(matches!(err, BlasError::ResourceLeak(1)));
    assert_eq!(err.kind(), ErrorKind::ResourceLeak);

    // Everything the runtime owns itself is still released.
    assert_eq!(driver.live_buffers(), 1);
}

#[test]
#[should_panic(expected = "exit(1)")]
fn dropping_a_leaking_context_is_fatal() {
    let (_, ctx) = mock_context();
    let _leaked = support::malloc(&ctx, 128, 32);
    drop(ctx);
}

#[test]
fn clean_context_releases_every_buffer() {
    let (driver, ctx) = mock_context();
    {
        let x = DmaVec::from_fn(&ctx, 4096, value);
        let mut y = DmaVec::zeros(&ctx, 4096);
        blas::scopy(&ctx, 4096, &x, 1, &mut y, 1);
    }
    ctx.finalize().unwrap();
    assert_eq!(driver.live_buffers(), 0);
}

#[test]
fn invalid_arguments_have_no_side_effects() {
    let (driver, ctx) = mock_context();
    let n = KernelKind::Saxpy.granularity().align() * 2;
    let x = DmaVec::from_fn(&ctx, n, value);
    let mut y = DmaVec::from_fn(&ctx, n, |i| value(i + 1));
    let before: Vec<f32> = y.to_vec();

    let cases = [(0, 1, 1), (-5, 1, 1), (n as i32, 0, 1), (n as i32, 1, -1)];
    for (len, incx, incy) in cases {
        let err = blas::try_saxpy(&ctx, len, 2.0, &x, incx, &mut y, incy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    let err = blas::try_sdot(&ctx, n as i32 + 1, &x, 1, &y, 1).unwrap_err();
    assert_eq!(err.info(), 2);

    assert_eq!(y.to_vec(), before);
    assert!(driver.submissions().is_empty());
    assert!(driver.waits().is_empty());

    drop((x, y));
    ctx.finalize().unwrap();
}

#[test]
#[should_panic(expected = "exit(1)")]
fn invalid_length_is_fatal() {
    let (_, ctx) = mock_context();
    let x = [1.0f32; 4];
    let mut y = [0.0f32; 4];
    blas::scopy(&ctx, 0, &x, 1, &mut y, 1);
}

#[test]
#[should_panic(expected = "exit(1)")]
fn invalid_stride_is_fatal() {
    let (_, ctx) = mock_context();
    let x = [1.0f32; 4];
    let _ = blas::snrm2(&ctx, 4, &x, -1);
}

#[test]
fn timeout_is_reported_after_the_host_tail_ran() {
    let (driver, ctx) = mock_context();
    ctx.set_timeout(Duration::from_millis(5));
    let align = KernelKind::Saxpy.granularity().align();
    let n = align + 10;
    let x = DmaVec::from_fn(&ctx, n, |_| 1.0);
    let mut y = DmaVec::zeros(&ctx, n);

    driver.hang(true);
    let err = blas::try_saxpy(&ctx, n as i32, 2.0, &x, 1, &mut y, 1).unwrap_err();
    assert!(matches!(
        err,
        BlasError::WaitTimeout {
            timeout_ns: 5_000_000,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::WaitTimeout);

    // The host remainder overlaps the job; the accelerated prefix never completed.
    assert!(y[align..].iter().all(|&v| v == 2.0));
    assert!(y[..align].iter().all(|&v| v == 0.0));

    driver.hang(false);
    drop((x, y));
    ctx.finalize().unwrap();
    assert_eq!(driver.pending_jobs(), 0);
    assert_eq!(driver.live_buffers(), 0);
}

#[test]
fn timed_out_job_blocks_later_dispatch() {
    let (driver, ctx) = mock_context();
    ctx.set_timeout(Duration::from_millis(5));
    let n = KernelKind::Sdot.granularity().align();
    let x = DmaVec::from_fn(&ctx, n, |_| 1.0);
    let mut y = DmaVec::zeros(&ctx, n);

    driver.hang(true);
    let err = blas::try_saxpy(&ctx, n as i32, 2.0, &x, 1, &mut y, 1).unwrap_err();
    assert!(matches!(err, BlasError::WaitTimeout { .. }));
    driver.hang(false);

    // The saxpy job still owns the uniform buffer, so nothing else may be submitted.
    let err = blas::try_sdot(&ctx, n as i32, &x, 1, &x, 1).unwrap_err();
    assert!(matches!(err, BlasError::JobOutstanding { .. }));
    assert_eq!(err.kind(), ErrorKind::WaitTimeout);
    assert_eq!(driver.submissions().len(), 1);
    assert_eq!(driver.pending_jobs(), 1);

    // Host-only sizes never reach the device.
    assert_eq!(blas::try_sdot(&ctx, 3, &x, 1, &x, 1).unwrap(), 3.0);

    drop((x, y));
    ctx.finalize().unwrap();
    assert_eq!(driver.pending_jobs(), 0);
    assert_eq!(driver.live_buffers(), 0);
}

#[test]
fn finalize_keeps_memory_of_a_job_that_never_completes() {
    let (driver, ctx) = mock_context();
    ctx.set_timeout(Duration::from_millis(1));
    let n = KernelKind::Scopy.granularity().align();
    let x = DmaVec::from_fn(&ctx, n, value);
    let mut y = DmaVec::zeros(&ctx, n);

    driver.hang(true);
    assert!(blas::try_scopy(&ctx, n as i32, &x, 1, &mut y, 1).is_err());
    drop((x, y));

    let err = ctx.finalize().unwrap_err();
    assert!(matches!(err, BlasError::JobOutstanding { .. }));
    assert_eq!(driver.pending_jobs(), 1);
    assert!(driver.live_buffers() > 0);
}

#[test]
#[should_panic(expected = "exit(1)")]
fn timeout_is_fatal() {
    let (driver, ctx) = mock_context();
    ctx.set_timeout(Duration::from_millis(1));
    let n = KernelKind::Snrm2.granularity().align();
    let x = DmaVec::from_fn(&ctx, n, value);
    driver.hang(true);
    let _ = blas::snrm2(&ctx, n as i32, &x, 1);
}

#[test]
fn rejected_submission_is_a_dispatch_error() {
    let (driver, ctx) = mock_context();
    let n = KernelKind::Scopy.granularity().align() + 1;
    let x = DmaVec::from_fn(&ctx, n, value);
    let mut y = DmaVec::zeros(&ctx, n);

    driver.fail_submissions(true);
    let err = blas::try_scopy(&ctx, n as i32, &x, 1, &mut y, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dispatch);
    assert!(y.iter().all(|&v| v == 0.0));
    assert!(driver.waits().is_empty());

    drop((x, y));
    ctx.finalize().unwrap();
}

#[test]
fn missing_kernel_only_matters_once_the_bulk_is_non_empty() {
    let driver = MockDriver::new();
    let config = RuntimeConfig::default().with_exit_handler(panic_exit);
    let library = KernelLibrary::placeholder();
    let partial = library
        .iter()
        .filter(|(kind, _)| *kind != KernelKind::Sasum)
        .fold(KernelLibrary::new(), |lib, (kind, image)| {
            lib.with_image(kind, image.to_vec())
        });
    let ctx = Context::new(driver, &partial, &config).unwrap();

    let align = KernelKind::Sasum.granularity().align();
    let x = DmaVec::from_fn(&ctx, align, |_| -1.0);
    assert_eq!(blas::try_sasum(&ctx, align as i32 - 1, &x, 1).unwrap(), (align - 1) as f32);

    let err = blas::try_sasum(&ctx, align as i32, &x, 1).unwrap_err();
    assert!(matches!(err, BlasError::KernelNotLoaded(KernelKind::Sasum)));
    assert_eq!(err.kind(), ErrorKind::Dispatch);

    drop(x);
    ctx.finalize().unwrap();
}

#[test]
fn exit_handler_can_be_replaced_at_runtime() {
    let driver = MockDriver::new();
    let ctx = Context::new(driver, &KernelLibrary::placeholder(), &RuntimeConfig::default()).unwrap();
    ctx.set_exit_handler(Some(panic_exit));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let x = [1.0f32; 2];
        let _ = blas::sasum(&ctx, -1, &x, 1);
    }));
    assert!(result.is_err());
    ctx.finalize().unwrap();
}
