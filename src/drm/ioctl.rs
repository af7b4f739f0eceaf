use crate::utils::{DRM_COMMAND_BASE, drm_iow, drm_iowr};

// ===============================================================================================
// DRM Core
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct DrmVersion {
    pub version_major: libc::c_int,
    pub version_minor: libc::c_int,
    pub version_patchlevel: libc::c_int,
    pub name_len: libc::size_t,
    pub name: *mut libc::c_char,
    pub date_len: libc::size_t,
    pub date: *mut libc::c_char,
    pub desc_len: libc::size_t,
    pub desc: *mut libc::c_char,
}

impl Default for DrmVersion {
    fn default() -> Self {
        Self {
            version_major: 0,
            version_minor: 0,
            version_patchlevel: 0,
            name_len: 0,
            name: std::ptr::null_mut(),
            date_len: 0,
            date: std::ptr::null_mut(),
            desc_len: 0,
            desc: std::ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

pub const DRM_IOCTL_VERSION: u32 = drm_iowr::<DrmVersion>(0x00);
pub const DRM_IOCTL_GEM_CLOSE: u32 = drm_iow::<GemCloseArgs>(0x09);

// ===============================================================================================
// V3D Buffer Objects
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct V3dCreateBoArgs {
    pub size: u32,
    pub flags: u32,
    /// Returned: address of the BO in the V3D address space.
    pub offset: u32,
    /// Returned: GEM handle.
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct V3dMmapBoArgs {
    pub handle: u32,
    pub flags: u32,
    /// Returned: fake offset to pass to `mmap` on the DRM fd.
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct V3dWaitBoArgs {
    pub handle: u32,
    pub pad: u32,
    pub timeout_ns: u64,
}

// ===============================================================================================
// V3D Parameters
// ===============================================================================================

pub const DRM_V3D_PARAM_SUPPORTS_CSD: u32 = 8;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct V3dGetParamArgs {
    pub param: u32,
    pub pad: u32,
    pub value: u64,
}

// ===============================================================================================
// Compute Shader Dispatch
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct V3dSubmitCsdArgs {
    pub cfg: [u32; 7],
    pub coef: [u32; 4],
    /// Pointer to a `u32` array of BO handles referenced by the job.
    pub bo_handles: u64,
    pub bo_handle_count: u32,
    pub in_sync: u32,
    pub out_sync: u32,
    pub perfmon_id: u32,
}

/// `(shift, width)` of each CSD configuration field.
pub mod csd_field {
    pub const CFG012_WG_OFFSET: (u32, u32) = (0, 16);
    pub const CFG012_NUM_WGS: (u32, u32) = (16, 16);
    pub const CFG3_WG_SIZE: (u32, u32) = (0, 8);
    pub const CFG3_WGS_PER_SG: (u32, u32) = (8, 4);
    pub const CFG3_BATCHES_PER_SG_M1: (u32, u32) = (12, 8);
    pub const CFG3_MAX_SG_ID: (u32, u32) = (20, 6);
}

/// Places `value` into a CSD configuration field, truncating to its width.
#[must_use]
pub const fn csd_set_field(value: u32, field: (u32, u32)) -> u32 {
    let (shift, width) = field;
    (value & ((1 << width) - 1)) << shift
}

const V3D_CREATE_BO: u32 = 0x02;
const V3D_WAIT_BO: u32 = 0x01;
const V3D_MMAP_BO: u32 = 0x03;
const V3D_GET_PARAM: u32 = 0x04;
const V3D_SUBMIT_CSD: u32 = 0x07;

pub const DRM_IOCTL_V3D_WAIT_BO: u32 = drm_iowr::<V3dWaitBoArgs>(DRM_COMMAND_BASE + V3D_WAIT_BO);
pub const DRM_IOCTL_V3D_CREATE_BO: u32 =
    drm_iowr::<V3dCreateBoArgs>(DRM_COMMAND_BASE + V3D_CREATE_BO);
pub const DRM_IOCTL_V3D_MMAP_BO: u32 = drm_iowr::<V3dMmapBoArgs>(DRM_COMMAND_BASE + V3D_MMAP_BO);
pub const DRM_IOCTL_V3D_GET_PARAM: u32 =
    drm_iowr::<V3dGetParamArgs>(DRM_COMMAND_BASE + V3D_GET_PARAM);
pub const DRM_IOCTL_V3D_SUBMIT_CSD: u32 =
    drm_iow::<V3dSubmitCsdArgs>(DRM_COMMAND_BASE + V3D_SUBMIT_CSD);

const _: () = assert!(std::mem::size_of::<V3dSubmitCsdArgs>() == 72);
const _: () = assert!(std::mem::size_of::<V3dWaitBoArgs>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_numbers() {
        assert_eq!(DRM_IOCTL_V3D_CREATE_BO, 0xC010_6442);
        assert_eq!(DRM_IOCTL_V3D_WAIT_BO, 0xC010_6441);
        assert_eq!(DRM_IOCTL_V3D_SUBMIT_CSD, 0x4048_6447);
        assert_eq!(DRM_IOCTL_V3D_MMAP_BO, 0xC010_6443);
        assert_eq!(DRM_IOCTL_V3D_GET_PARAM, 0xC010_6444);
        assert_eq!(DRM_V3D_PARAM_SUPPORTS_CSD, 8);
    }

    #[test]
    fn fields_are_masked_to_width() {
        assert_eq!(csd_set_field(16, csd_field::CFG012_NUM_WGS), 16 << 16);
        // Sixteen work-groups per supergroup is encoded as 0 in the 4-bit field.
        assert_eq!(csd_set_field(16, csd_field::CFG3_WGS_PER_SG), 0);
        assert_eq!(csd_set_field(15, csd_field::CFG3_BATCHES_PER_SG_M1), 15 << 12);
    }
}
