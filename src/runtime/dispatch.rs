#![allow(clippy::cast_possible_truncation)]

use crate::drm::Driver;
use crate::drm::ioctl::{csd_field, csd_set_field};
use crate::error::{BlasError, BlasResult};
use std::time::Duration;

/// Work-groups per dispatch in X; Y and Z are always 1.
const NUM_WGS_X: u32 = 16;
/// Invocations per work-group.
const WG_SIZE: u32 = 16;
/// Work-groups per supergroup.
const WGS_PER_SG: u32 = 16;

/// One compute dispatch. Only `parallelism` (the batch count) varies between jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub kernel_bus: u32,
    pub uniform_bus: u32,
    pub parallelism: u32,
    /// Handles of the buffers the job references, in submission order.
    pub handles: Vec<u32>,
}

impl JobDescriptor {
    /// The seven CSD configuration words for this job.
    #[must_use]
    pub const fn csd_config(&self) -> [u32; 7] {
        [
            csd_set_field(NUM_WGS_X, csd_field::CFG012_NUM_WGS)
                | csd_set_field(0, csd_field::CFG012_WG_OFFSET),
            csd_set_field(1, csd_field::CFG012_NUM_WGS)
                | csd_set_field(0, csd_field::CFG012_WG_OFFSET),
            csd_set_field(1, csd_field::CFG012_NUM_WGS)
                | csd_set_field(0, csd_field::CFG012_WG_OFFSET),
            csd_set_field(0, csd_field::CFG3_MAX_SG_ID)
                | csd_set_field(WGS_PER_SG - 1, csd_field::CFG3_BATCHES_PER_SG_M1)
                | csd_set_field(WGS_PER_SG, csd_field::CFG3_WGS_PER_SG)
                | csd_set_field(WG_SIZE, csd_field::CFG3_WG_SIZE),
            // Number of batches, minus 1
            self.parallelism - 1,
            self.kernel_bus,
            // Uniforms address (4 byte aligned)
            self.uniform_bus,
        ]
    }
}

/// Enqueue `job`. Returns once the driver has accepted it, not when it completes.
pub fn submit(driver: &dyn Driver, job: &JobDescriptor) -> BlasResult<()> {
    let cfg = job.csd_config();
    let coef = [0u32; 4];

    driver
        .submit_csd(&cfg, &coef, &job.handles)
        .map_err(BlasError::Submit)?;

    log::debug!(
        "submitted kernel {:#010x} x{} (unif {:#010x}, handles {:?})",
        job.kernel_bus,
        job.parallelism,
        job.uniform_bus,
        job.handles
    );
    Ok(())
}

/// Block until the driver reports every handle idle.
///
/// Each handle must be one the job writes last; completion is observed on the
/// output buffer itself. Timeout and driver failure are both errors.
pub fn wait_for_handles(driver: &dyn Driver, timeout: Duration, handles: &[u32]) -> BlasResult<()> {
    let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);

    for &handle in handles {
        if let Err(source) = driver.wait_bo(handle, timeout_ns) {
            return Err(if source.raw_os_error() == Some(libc::ETIME) {
                BlasError::WaitTimeout { handle, timeout_ns }
            } else {
                BlasError::Wait { handle, source }
            });
        }
    }
    Ok(())
}
