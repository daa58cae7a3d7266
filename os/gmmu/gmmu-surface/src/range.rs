use crate::{PmError, SurfaceId};

/// A byte range of one surface.
///
/// Ranges name their surface by [`SurfaceId`]; a range outliving its surface
/// is detected on use, not prevented.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PmMemRange {
    pub surface: SurfaceId,
    pub offset: u64,
    pub size: u64,
}

impl PmMemRange {
    #[must_use]
    pub const fn new(surface: SurfaceId, offset: u64, size: u64) -> Self {
        Self { surface, offset, size }
    }

    /// One past the last byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }

    /// Whether `other` lies entirely inside `self`.
    #[must_use]
    pub fn contains_range(&self, other: &Self) -> bool {
        self.surface == other.surface && self.offset <= other.offset && other.end() <= self.end()
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.surface == other.surface && self.offset < other.end() && other.offset < self.end()
    }

    /// The common part of two ranges of one surface.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        Some(Self::new(self.surface, start, end - start))
    }

    /// Sub-range `[offset, offset + size)` relative to this range's start.
    ///
    /// # Errors
    /// [`PmError::InvalidArgument`] if it does not fit.
    pub fn subrange(&self, offset: u64, size: u64) -> Result<Self, PmError> {
        let end = offset
            .checked_add(size)
            .ok_or(PmError::InvalidArgument("sub-range wraps around"))?;
        if end > self.size {
            return Err(PmError::InvalidArgument("sub-range exceeds range"));
        }
        Ok(Self::new(self.surface, self.offset + offset, size))
    }
}
