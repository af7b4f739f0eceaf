use crate::runtime::kernels::KernelKind;
use std::io;
use thiserror::Error;

/// Coarse classification of every failure the runtime can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-positive length or stride, or an operand slice too short for it.
    Validation,
    /// Driver allocation, free or address resolution failure.
    Allocation,
    /// Job submission rejected, or no kernel image to submit.
    Dispatch,
    /// The accelerator did not signal completion, or the wait itself failed.
    WaitTimeout,
    /// Teardown found allocations that were never released.
    ResourceLeak,
}

#[derive(Error, Debug)]
pub enum BlasError {
    #[error("parameter {position} ({name}) is invalid: {reason}")]
    InvalidArgument {
        position: i32,
        name: &'static str,
        reason: String,
    },

    #[error("DRM buffer allocation of {size} bytes failed: {source}")]
    Allocation { size: usize, source: io::Error },

    #[error("DRM buffer release of handle {handle} failed: {source}")]
    Free { handle: u32, source: io::Error },

    #[error("Memory address {0:#x} is not inside a live DMA allocation")]
    UnknownAddress(usize),

    #[error("Memory span {addr:#x}+{len} crosses the end of its DMA allocation")]
    SpanOutOfRegion { addr: usize, len: usize },

    #[error("Memory area starting at {0:#x} is not known")]
    UnknownAlignedPointer(usize),

    #[error("drm_v3d_submit_csd: {0}")]
    Submit(io::Error),

    #[error("Kernel image for {0} is not loaded")]
    KernelNotLoaded(KernelKind),

    #[error("Kernel image for {kind} is malformed: {reason}")]
    InvalidKernelImage { kind: KernelKind, reason: String },

    #[error("Uniform buffer overflow: {needed} words requested, {capacity} available")]
    UniformOverflow { needed: usize, capacity: usize },

    #[error("drm_v3d_wait_bo: handle {handle} timed out after {timeout_ns} ns")]
    WaitTimeout { handle: u32, timeout_ns: u64 },

    #[error("drm_v3d_wait_bo: handle {handle}: {source}")]
    Wait { handle: u32, source: io::Error },

    #[error("A job using handle {handle} never completed; no further jobs can be dispatched")]
    JobOutstanding { handle: u32 },

    #[error("Memory was not all freed ({0} areas remaining)")]
    ResourceLeak(usize),

    #[error("DRM device error: {0}")]
    Device(io::Error),

    #[error("Runtime {0} are not initialized")]
    Uninitialized(&'static str),
}

impl BlasError {
    pub(crate) fn invalid(position: i32, name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            position,
            name,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::Validation,
            Self::Allocation { .. }
            | Self::Free { .. }
            | Self::UnknownAddress(_)
            | Self::SpanOutOfRegion { .. }
            | Self::UnknownAlignedPointer(_)
            | Self::Device(_) => ErrorKind::Allocation,
            Self::Submit(_)
            | Self::KernelNotLoaded(_)
            | Self::InvalidKernelImage { .. }
            | Self::UniformOverflow { .. }
            | Self::Uninitialized(_) => ErrorKind::Dispatch,
            Self::WaitTimeout { .. } | Self::Wait { .. } | Self::JobOutstanding { .. } => {
                ErrorKind::WaitTimeout
            }
            Self::ResourceLeak(_) => ErrorKind::ResourceLeak,
        }
    }

    /// The BLAS `info` value reported alongside a fatal error.
    #[must_use]
    pub fn info(&self) -> i32 {
        match self {
            Self::InvalidArgument { position, .. } => *position,
            Self::Allocation { source, .. }
            | Self::Free { source, .. }
            | Self::Wait { source, .. } => source.raw_os_error().unwrap_or(1),
            Self::Submit(e) | Self::Device(e) => e.raw_os_error().unwrap_or(1),
            Self::WaitTimeout { .. } | Self::JobOutstanding { .. } => libc::ETIME,
            _ => 1,
        }
    }
}

// A convenient alias
pub type BlasResult<T> = Result<T, BlasError>;
