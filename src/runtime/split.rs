#![allow(clippy::cast_possible_truncation)]

//! The bulk/remainder execution shared by every accelerated routine.
//!
//! The accelerator takes the largest prefix that is a whole number of passes over its
//! lanes; the host computes the tail while the job is in flight, and only then waits.

use crate::error::{BlasError, BlasResult};
use crate::runtime::context::Context;
use crate::runtime::dispatch::{self, JobDescriptor};
use crate::runtime::kernels::KernelKind;
use crate::runtime::memory::{DmaMemoryManager, Resolved};
use crate::runtime::uniform::{UniformBuffer, Uniforms};

/// How `n` elements are divided between the accelerator and the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    /// Leading elements processed by the accelerator, a multiple of the alignment.
    pub bulk: usize,
    /// Trailing elements processed on the host, always `< align`.
    pub remainder: usize,
}

impl Split {
    #[must_use]
    pub const fn new(n: usize, align: usize) -> Self {
        let remainder = n % align;
        Self {
            bulk: n - remainder,
            remainder,
        }
    }
}

/// Everything a bulk job needs besides its kernel.
#[derive(Debug, Default)]
pub(crate) struct Staged {
    pub uniforms: Uniforms,
    /// Every buffer the job touches, without duplicates.
    pub handles: Vec<u32>,
    /// The buffers the job writes last; completion is waited on these.
    pub outputs: Vec<u32>,
}

impl Staged {
    pub fn new(uniforms: Uniforms) -> Self {
        Self {
            uniforms,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn reads(self, operand: Resolved) -> Self {
        self.uses(operand.handle)
    }

    #[must_use]
    pub fn uses(mut self, handle: u32) -> Self {
        if !self.handles.contains(&handle) {
            self.handles.push(handle);
        }
        self
    }

    #[must_use]
    pub fn writes(mut self, handle: u32) -> Self {
        if !self.handles.contains(&handle) {
            self.handles.push(handle);
        }
        if !self.outputs.contains(&handle) {
            self.outputs.push(handle);
        }
        self
    }
}

/// One numeric routine, expressed as the pieces the split executor sequences.
pub(crate) trait SplitRoutine {
    type Output;

    fn kernel(&self) -> KernelKind;

    /// Extent of the split dimension (elements, rows or columns).
    fn len(&self) -> usize;

    /// Resolve operands and build the uniforms for the first `bulk` units of work.
    fn stage(
        &self,
        memory: &DmaMemoryManager,
        unif: &UniformBuffer,
        bulk: usize,
    ) -> BlasResult<Staged>;

    /// Compute `count` units of work starting at `start` on the host.
    fn host(&mut self, start: usize, count: usize);

    /// Combine the host result with the per-lane partials of a reduction, if any.
    fn finish(self, partials: Option<&[f32]>) -> Self::Output;
}

/// Resolve the DMA span backing `operand`.
pub(crate) fn resolve_operand(memory: &DmaMemoryManager, operand: &[f32]) -> BlasResult<Resolved> {
    memory.resolve_span(operand.as_ptr() as usize, size_of_val(operand))
}

/// A count that goes into a 32-bit uniform slot.
pub(crate) fn word(position: i32, name: &'static str, value: usize) -> BlasResult<u32> {
    u32::try_from(value).map_err(|_| BlasError::invalid(position, name, "does not fit 32 bits"))
}

/// Partition, dispatch the bulk, compute the host tail, then wait and merge.
///
/// Arguments must already be validated. When the split leaves no bulk the accelerator
/// is not touched at all, so host-only sizes work on any memory. A failed wait leaves
/// the job outstanding on the context, and every later bulk dispatch is refused.
pub(crate) fn execute<R: SplitRoutine>(ctx: &Context, mut routine: R) -> BlasResult<R::Output> {
    let kernel = routine.kernel();
    let granularity = kernel.granularity();
    let split = Split::new(routine.len(), granularity.align());
    log::trace!("{kernel}: validated, {split:?}");

    let mut pending = None;
    if split.bulk > 0 {
        ctx.ensure_idle()?;
        let code_bus = ctx.kernel_bus(kernel)?;
        let unif = ctx.uniform_buffer()?;
        let staged = routine
            .stage(&ctx.memory.borrow(), unif, split.bulk)?
            .uses(unif.handle());
        unif.load(&staged.uniforms)?;

        let job = JobDescriptor {
            kernel_bus: code_bus,
            uniform_bus: unif.bus_addr(),
            parallelism: granularity.units as u32,
            handles: staged.handles,
        };
        dispatch::submit(ctx.driver(), &job)?;
        log::trace!("{kernel}: bulk of {} dispatched", split.bulk);
        pending = Some((unif, staged.outputs));
    }

    routine.host(split.bulk, split.remainder);

    let mut partials = None;
    if let Some((unif, outputs)) = pending {
        log::trace!("{kernel}: waiting on {outputs:?}");
        if let Err(e) = dispatch::wait_for_handles(ctx.driver(), ctx.timeout(), &outputs) {
            ctx.mark_outstanding(unif.handle());
            return Err(e);
        }
        if kernel.is_reduction() {
            partials = Some(unif.partials(granularity.lanes())?);
        }
    }

    log::trace!("{kernel}: completed");
    Ok(routine.finish(partials.as_deref()))
}
