use crate::{PageSize, align_down, is_aligned};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// GPU virtual memory address.
///
/// A thin wrapper around `u64` that denotes addresses inside a GPU address
/// space. It does not validate that the address fits the VA width of any
/// particular MMU generation; level descriptors extract only the bits they own.
///
/// ### Examples
/// ```rust
/// # use gmmu_addresses::*;
/// let va = GpuVirtualAddress::new(0x20_0000_1234);
/// assert_eq!(va.page(PageSize::Size4K).as_u64(), 0x20_0000_1000);
/// assert_eq!(va.offset(PageSize::Size4K), 0x234);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GpuVirtualAddress(u64);

impl GpuVirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn page(self, ps: PageSize) -> Self {
        Self(align_down(self.0, ps.bytes()))
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, ps: PageSize) -> u64 {
        self.0 & (ps.bytes() - 1)
    }

    #[inline]
    #[must_use]
    pub const fn split(self, ps: PageSize) -> (Self, u64) {
        (self.page(ps), self.offset(ps))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        is_aligned(self.0, align)
    }

    /// Extract bits `hi..=lo` (inclusive) as an index.
    #[inline]
    #[must_use]
    pub const fn bits(self, hi: u32, lo: u32) -> u64 {
        let width = hi - lo + 1;
        (self.0 >> lo) & ((1u64 << width) - 1)
    }
}

impl fmt::Debug for GpuVirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:014X})", self.0)
    }
}

impl fmt::Display for GpuVirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:014X}", self.0)
    }
}

impl From<u64> for GpuVirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for GpuVirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for GpuVirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for GpuVirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_bits() {
        let va = GpuVirtualAddress::new(0x0000_0003_2345_6000);
        assert_eq!(va.bits(20, 12), 0x56);
        assert_eq!(va.bits(28, 21), (0x3_2345_6000u64 >> 21) & 0xFF);
        assert_eq!(va.bits(37, 29), 0x19);
    }

    #[test]
    fn page_and_offset() {
        let va = GpuVirtualAddress::new(0x21_0042);
        let (page, off) = va.split(PageSize::Size2M);
        assert_eq!(page.as_u64(), 0x20_0000);
        assert_eq!(off, 0x1_0042);
        assert_eq!(va - page, off);
    }
}
