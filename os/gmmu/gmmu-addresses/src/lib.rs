//! # GPU Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw values the GMMU mirror passes around:
//! GPU virtual addresses, physical addresses, page sizes, apertures and the
//! opaque handles a device driver hands out.
//!
//! ## Overview
//!
//! | Type | Description |
//! |----------|-------------|
//! | [`GpuVirtualAddress`] | An address in a GPU address space (translated by the GMMU). |
//! | [`PhysicalAddress`] | A bus address inside one [`Aperture`] (video memory, peer, system memory). |
//! | [`PageSize`] | One of the four leaf granularities (4 KiB, 64 KiB, 2 MiB, 512 MiB). |
//! | [`Aperture`] | Which memory a physical address refers to. |
//! | [`Location`] | Where a buffer's backing lives, from the allocator's point of view. |
//! | [`MemHandle`] / [`VaSpaceHandle`] / [`DeviceId`] | Opaque driver handles. |
//!
//! ## Typical Usage
//!
//! ```rust
//! # use gmmu_addresses::*;
//! let va = GpuVirtualAddress::new(0x0000_0020_0012_3456);
//! let (page, off) = va.split(PageSize::Size64K);
//! assert_eq!(page.as_u64() & (PageSize::Size64K.bytes() - 1), 0);
//! assert_eq!((page + off).as_u64(), va.as_u64());
//!
//! let pa = PhysicalAddress::new(0x1_2000_0000);
//! assert!(pa.is_aligned_to(PageSize::Size2M.bytes()));
//! ```
//!
//! ## Design Notes
//!
//! - The address types are `#[repr(transparent)]` and implement `Copy`, `Eq`,
//!   `Ord` and `Hash`, making them suitable as map keys.
//! - Page sizes are a runtime enum rather than marker types: the page size of a
//!   GPU mapping is mutable state (see `change_page_size` in the surface crate).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod aperture;
mod page_size;
mod physical_address;
mod virtual_address;

use core::fmt;

pub use crate::aperture::{Aperture, Location};
pub use crate::page_size::PageSize;
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::GpuVirtualAddress;

/// Handle of a physical memory allocation as issued by the device driver.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemHandle(pub u32);

/// Handle of a GPU virtual address space.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VaSpaceHandle(pub u32);

/// Identifies one GPU device (all of its subdevices share page tables).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hMem(0x{:08X})", self.0)
    }
}

impl fmt::Debug for VaSpaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hVASpace(0x{:08X})", self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// This returns the greatest value `y <= x` such that `y % a == 0`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use gmmu_addresses::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// assert_eq!(align_down(0x2F_FFFF, 0x20_0000), 0x20_0000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u64`.
///
/// ### Examples
/// ```rust
/// # use gmmu_addresses::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4097,    4096), 8192);
/// assert_eq!(align_up(0x1_0001, 0x1_0000), 0x2_0000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Whether `x` is a multiple of the power of two `a`.
#[inline(always)]
#[must_use]
pub const fn is_aligned(x: u64, a: u64) -> bool {
    x & (a - 1) == 0
}
