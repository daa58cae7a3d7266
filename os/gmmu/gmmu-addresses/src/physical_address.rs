use crate::{PageSize, align_down, is_aligned};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address.
///
/// A thin wrapper around `u64` that denotes **physical** addresses (video
/// memory, peer memory or system memory, as selected by an
/// [`Aperture`](crate::Aperture)). This type carries intent and prevents
/// accidental VA↔PA mix-ups.
///
/// ### Notes
/// - Page-table entries store a page-aligned physical base shifted right by
///   12 bits; use [`split`](Self::split) to reason about base vs. offset.
///
/// ### Examples
/// ```rust
/// # use gmmu_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
/// let (base, off) = pa.split(PageSize::Size4K);
/// assert_eq!(base.as_u64(), 0x0000_0010_2000_0000);
/// assert_eq!(off, 0x42);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page base of the page of size `ps` that contains this address.
    #[inline]
    #[must_use]
    pub const fn page(self, ps: PageSize) -> Self {
        Self(align_down(self.0, ps.bytes()))
    }

    /// Offset of this address within its page of size `ps`.
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

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:010X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for PhysicalAddress {
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
    fn split_and_join() {
        let pa = PhysicalAddress::new(0x1234_5678);
        let (base, off) = pa.split(PageSize::Size64K);
        assert_eq!(base.as_u64(), 0x1234_0000);
        assert_eq!(off, 0x5678);
        assert_eq!(base + off, pa);
        assert_eq!(pa - base, off);
    }

    #[test]
    fn checked_add_overflows() {
        assert!(PhysicalAddress::new(u64::MAX).checked_add(1).is_none());
        assert_eq!(
            PhysicalAddress::new(1).checked_add(1),
            Some(PhysicalAddress::new(2))
        );
    }
}
