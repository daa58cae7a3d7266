use core::fmt;

/// Leaf page granularities of the GMMU.
///
/// | Variant | Bytes | Mapped by |
/// |---------|-------|-----------|
/// | [`Size4K`](Self::Size4K) | 4 KiB | small-page PTE |
/// | [`Size64K`](Self::Size64K) | 64 KiB | big-page PTE |
/// | [`Size2M`](Self::Size2M) | 2 MiB | PDE0 slot used as a leaf ("huge") |
/// | [`Size512M`](Self::Size512M) | 512 MiB | PDE1 slot used as a leaf ("giant") |
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PageSize {
    Size4K,
    Size64K,
    Size2M,
    Size512M,
}

impl PageSize {
    /// All page sizes, smallest first.
    pub const ALL: [Self; 4] = [Self::Size4K, Self::Size64K, Self::Size2M, Self::Size512M];

    /// log2 of the page size.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Size4K => 12,
            Self::Size64K => 16,
            Self::Size2M => 21,
            Self::Size512M => 29,
        }
    }

    /// Page size in bytes (power of two).
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        1 << self.shift()
    }

    /// Look up the page size with exactly `bytes` bytes.
    #[must_use]
    pub const fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            0x1000 => Some(Self::Size4K),
            0x1_0000 => Some(Self::Size64K),
            0x20_0000 => Some(Self::Size2M),
            0x2000_0000 => Some(Self::Size512M),
            _ => None,
        }
    }

    /// Number of pages needed to cover `len` bytes.
    #[inline]
    #[must_use]
    pub const fn pages_for(self, len: u64) -> u64 {
        len.div_ceil(self.bytes())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Size4K => "4K",
            Self::Size64K => "64K",
            Self::Size2M => "2M",
            Self::Size512M => "512M",
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_match_shift() {
        for ps in PageSize::ALL {
            assert_eq!(ps.bytes(), 1 << ps.shift());
            assert_eq!(PageSize::from_bytes(ps.bytes()), Some(ps));
        }
        assert_eq!(PageSize::from_bytes(0x2_0000), None);
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(PageSize::Size64K.pages_for(0), 0);
        assert_eq!(PageSize::Size64K.pages_for(1), 1);
        assert_eq!(PageSize::Size64K.pages_for(0x2_0001), 3);
    }

    #[test]
    fn ordering_is_by_size() {
        assert!(PageSize::Size4K < PageSize::Size64K);
        assert!(PageSize::Size2M < PageSize::Size512M);
    }
}
