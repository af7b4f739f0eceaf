#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

/// `DRM_IOCTL_BASE` ('d').
pub const DRM_IOCTL_BASE: u32 = 0x64;
/// First driver-private DRM request number.
pub const DRM_COMMAND_BASE: u32 = 0x40;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// `DRM_IOW(nr, T)`
#[must_use]
pub const fn drm_iow<T>(nr: u32) -> u32 {
    iow::<T>(DRM_IOCTL_BASE, nr)
}

/// `DRM_IOWR(nr, T)`
#[must_use]
pub const fn drm_iowr<T>(nr: u32) -> u32 {
    iowr::<T>(DRM_IOCTL_BASE, nr)
}

/// True for 1, 2, 4, ... within the positive `i32` range.
#[must_use]
pub const fn is_valid_alignment(alignment: i32) -> bool {
    alignment > 0 && alignment & (alignment - 1) == 0
}

/// Smallest `o` such that `(bus_addr + o) % alignment == 0`.
///
/// `alignment` must be a power of two.
#[must_use]
pub const fn forward_offset(bus_addr: u32, alignment: u32) -> u32 {
    bus_addr.wrapping_neg() & (alignment - 1)
}

#[must_use]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}
