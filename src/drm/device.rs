#![allow(clippy::cast_possible_truncation)]

use crate::drm::Driver;
use crate::drm::ioctl::{
    DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_V3D_CREATE_BO, DRM_IOCTL_V3D_GET_PARAM,
    DRM_IOCTL_V3D_MMAP_BO, DRM_IOCTL_V3D_SUBMIT_CSD, DRM_IOCTL_V3D_WAIT_BO, DRM_IOCTL_VERSION,
    DRM_V3D_PARAM_SUPPORTS_CSD, DrmVersion, GemCloseArgs, V3dCreateBoArgs, V3dGetParamArgs,
    V3dMmapBoArgs, V3dSubmitCsdArgs, V3dWaitBoArgs,
};
use crate::runtime::memory::MemoryRegion;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

const DRIVER_NAME: &str = "v3d";

/// A handle to the V3D DRM device node.
///
/// The file is shared through an `Arc`, so clones are cheap and keep the device open
/// for as long as any of them is alive.
#[derive(Clone, Debug)]
pub struct V3dDevice {
    pub file: Arc<File>,
    pub path: PathBuf,
}

impl V3dDevice {
    /// Probes `/dev/dri/card*` then `/dev/dri/renderD*` for a `v3d` node with compute
    /// shader dispatch support.
    ///
    /// # Errors
    /// Returns `NotFound` if no suitable node exists.
    pub fn open() -> io::Result<Self> {
        let candidates = (0..8)
            .map(|i| PathBuf::from(format!("/dev/dri/card{i}")))
            .chain((128..136).map(|i| PathBuf::from(format!("/dev/dri/renderD{i}"))));

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::open_path(&path) {
                Ok(device) => return Ok(device),
                Err(e) => log::debug!("skipping {}: {e}", path.display()),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no V3D DRM device with CSD support found",
        ))
    }

    /// Opens a specific DRM node and checks that it is driven by `v3d` with CSD support.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened, belongs to another driver, or
    /// lacks compute shader dispatch.
    pub fn open_path(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let device = Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        };

        let name = device.driver_name()?;
        if name != DRIVER_NAME {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("driver is {name}, not {DRIVER_NAME}"),
            ));
        }
        if device.get_param(DRM_V3D_PARAM_SUPPORTS_CSD)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "kernel driver lacks compute shader dispatch",
            ));
        }

        log::debug!("opened {} ({DRIVER_NAME})", path.display());
        Ok(device)
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR | libc::EAGAIN) => {}
                _ => return Err(err),
            }
        }
    }

    // ===========================================================================================
    // Identification
    // ===========================================================================================

    /// The kernel driver name reported by `DRM_IOCTL_VERSION`.
    pub fn driver_name(&self) -> io::Result<String> {
        let mut args = DrmVersion::default();
        unsafe {
            self.ioctl(DRM_IOCTL_VERSION, &mut args)?;
        }

        let mut name = vec![0u8; args.name_len];
        args = DrmVersion {
            name_len: name.len(),
            name: name.as_mut_ptr().cast(),
            ..DrmVersion::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_VERSION, &mut args)?;
        }
        name.truncate(args.name_len);

        Ok(String::from_utf8_lossy(&name).into_owned())
    }

    /// Query a `DRM_V3D_PARAM_*` value.
    pub fn get_param(&self, param: u32) -> io::Result<u64> {
        let mut args = V3dGetParamArgs {
            param,
            ..V3dGetParamArgs::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_V3D_GET_PARAM, &mut args)?;
        }
        Ok(args.value)
    }

    // ===========================================================================================
    // Buffer Objects
    // ===========================================================================================

    /// Create a BO. Returns `(handle, offset)` where `offset` is the V3D address.
    pub fn create_bo(&self, size: u32) -> io::Result<(u32, u32)> {
        let mut args = V3dCreateBoArgs {
            size,
            ..V3dCreateBoArgs::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_V3D_CREATE_BO, &mut args)?;
        }
        Ok((args.handle, args.offset))
    }

    /// The fake `mmap` offset of a BO on this device's fd.
    pub fn mmap_bo(&self, handle: u32) -> io::Result<u64> {
        let mut args = V3dMmapBoArgs {
            handle,
            ..V3dMmapBoArgs::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_V3D_MMAP_BO, &mut args)?;
        }
        Ok(args.offset)
    }

    pub fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut args = GemCloseArgs { handle, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) }
    }

    fn map_bo(&self, handle: u32, size: usize) -> io::Result<*mut u8> {
        let offset = self.mmap_bo(handle)?;
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ret.cast::<u8>())
    }
}

impl Driver for V3dDevice {
    fn alloc_buffer(&self, size: usize) -> io::Result<MemoryRegion> {
        let bo_size = u32::try_from(size).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "buffer exceeds 4 GiB")
        })?;

        let (handle, bus_addr) = self.create_bo(bo_size)?;

        match self.map_bo(handle, size) {
            Ok(virt) => Ok(MemoryRegion {
                virt_addr: virt as usize,
                bus_addr,
                handle,
                size,
            }),
            Err(e) => {
                self.gem_close(handle).ok();
                Err(e)
            }
        }
    }

    fn free_buffer(&self, region: &MemoryRegion) -> io::Result<()> {
        let ret = unsafe { libc::munmap(region.virt_addr as *mut libc::c_void, region.size) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        self.gem_close(region.handle)
    }

    fn submit_csd(&self, cfg: &[u32; 7], coef: &[u32; 4], handles: &[u32]) -> io::Result<()> {
        let mut args = V3dSubmitCsdArgs {
            cfg: *cfg,
            coef: *coef,
            bo_handles: handles.as_ptr() as u64,
            bo_handle_count: handles.len() as u32,
            ..V3dSubmitCsdArgs::default()
        };
        unsafe { self.ioctl(DRM_IOCTL_V3D_SUBMIT_CSD, &mut args) }
    }

    fn wait_bo(&self, handle: u32, timeout_ns: u64) -> io::Result<()> {
        let mut args = V3dWaitBoArgs {
            handle,
            pad: 0,
            timeout_ns,
        };
        unsafe { self.ioctl(DRM_IOCTL_V3D_WAIT_BO, &mut args) }
    }
}

impl AsRawFd for V3dDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
