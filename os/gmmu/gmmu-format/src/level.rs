//! # Level descriptors
//!
//! Static descriptions of each page-table level per hardware generation. A
//! descriptor is shared by reference (`&'static`) with every tree, level and
//! segment built for a device; nothing owns it.

use crate::MmuVersion;
use gmmu_addresses::{GpuVirtualAddress, PageSize};

/// Position of a level in the tree, ordered from the root downwards.
///
/// `PteBig` and `PteSmall` are siblings: both hang off a PDE0 entry (the lo
/// and hi halves of the dual PDE respectively).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MmuLevelIndex {
    Pde4,
    Pde3,
    Pde2,
    Pde1,
    Pde0,
    PteBig,
    PteSmall,
}

impl MmuLevelIndex {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pde4 => "PDE4",
            Self::Pde3 => "PDE3",
            Self::Pde2 => "PDE2",
            Self::Pde1 => "PDE1",
            Self::Pde0 => "PDE0",
            Self::PteBig => "PTE_BIG",
            Self::PteSmall => "PTE_SMALL",
        }
    }
}

/// Shape of one level of the tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LevelDesc {
    pub index: MmuLevelIndex,
    /// Highest VA bit indexed by this level (inclusive).
    pub va_hi: u32,
    /// Lowest VA bit indexed by this level; also log2 of one entry's coverage.
    pub va_lo: u32,
    /// Entry size in bytes (16 for the dual PDE0).
    pub entry_size: u32,
    /// Page size mapped when an entry of this level is a leaf.
    pub leaf_page_size: Option<PageSize>,
    /// Whether entries may point to a lower table.
    pub directory: bool,
}

impl LevelDesc {
    const fn dir(index: MmuLevelIndex, va_hi: u32, va_lo: u32) -> Self {
        Self {
            index,
            va_hi,
            va_lo,
            entry_size: 8,
            leaf_page_size: None,
            directory: true,
        }
    }

    /// Bytes of VA covered by one entry.
    #[inline]
    #[must_use]
    pub const fn coverage(&self) -> u64 {
        1 << self.va_lo
    }

    #[inline]
    #[must_use]
    pub const fn entries_per_table(&self) -> u64 {
        1 << (self.va_hi - self.va_lo + 1)
    }

    /// Bytes of VA covered by one whole table of this level.
    #[inline]
    #[must_use]
    pub const fn table_span(&self) -> u64 {
        self.coverage() * self.entries_per_table()
    }

    #[inline]
    #[must_use]
    pub const fn table_bytes(&self) -> u64 {
        self.entries_per_table() * self.entry_size as u64
    }

    /// Index of the entry translating `va` inside its table.
    #[inline]
    #[must_use]
    pub const fn index_of(&self, va: GpuVirtualAddress) -> u64 {
        va.bits(self.va_hi, self.va_lo)
    }

    /// Entries of this level can be both a directory and a leaf.
    #[inline]
    #[must_use]
    pub const fn is_dual_purpose(&self) -> bool {
        self.directory && self.leaf_page_size.is_some()
    }

    /// Entries carry two pointer halves (big lo, small hi).
    #[inline]
    #[must_use]
    pub const fn is_dual_pde(&self) -> bool {
        self.entry_size == 16
    }

    #[inline]
    #[must_use]
    pub const fn is_leaf_only(&self) -> bool {
        !self.directory
    }
}

const PTE_BIG: LevelDesc = LevelDesc {
    index: MmuLevelIndex::PteBig,
    va_hi: 20,
    va_lo: 16,
    entry_size: 8,
    leaf_page_size: Some(PageSize::Size64K),
    directory: false,
};

const PTE_SMALL: LevelDesc = LevelDesc {
    index: MmuLevelIndex::PteSmall,
    va_hi: 20,
    va_lo: 12,
    entry_size: 8,
    leaf_page_size: Some(PageSize::Size4K),
    directory: false,
};

const PDE0: LevelDesc = LevelDesc {
    index: MmuLevelIndex::Pde0,
    va_hi: 28,
    va_lo: 21,
    entry_size: 16,
    leaf_page_size: Some(PageSize::Size2M),
    directory: true,
};

const LEVELS_V1_V2: [LevelDesc; 6] = [
    LevelDesc::dir(MmuLevelIndex::Pde3, 48, 47),
    LevelDesc::dir(MmuLevelIndex::Pde2, 46, 38),
    LevelDesc::dir(MmuLevelIndex::Pde1, 37, 29),
    PDE0,
    PTE_BIG,
    PTE_SMALL,
];

const LEVELS_V3: [LevelDesc; 7] = [
    LevelDesc::dir(MmuLevelIndex::Pde4, 56, 56),
    LevelDesc::dir(MmuLevelIndex::Pde3, 55, 47),
    LevelDesc::dir(MmuLevelIndex::Pde2, 46, 38),
    LevelDesc {
        leaf_page_size: Some(PageSize::Size512M),
        ..LevelDesc::dir(MmuLevelIndex::Pde1, 37, 29)
    },
    PDE0,
    PTE_BIG,
    PTE_SMALL,
];

/// Format descriptor of one hardware generation.
#[derive(Debug, Eq, PartialEq)]
pub struct MmuFormat {
    pub version: MmuVersion,
    /// Width of the virtual address in bits.
    pub va_bits: u32,
    /// Levels ordered root first.
    pub levels: &'static [LevelDesc],
}

impl MmuFormat {
    pub const V1: Self = Self {
        version: MmuVersion::V1,
        va_bits: 49,
        levels: &LEVELS_V1_V2,
    };

    pub const V2: Self = Self {
        version: MmuVersion::V2,
        va_bits: 49,
        levels: &LEVELS_V1_V2,
    };

    pub const V3: Self = Self {
        version: MmuVersion::V3,
        va_bits: 57,
        levels: &LEVELS_V3,
    };

    /// The `'static` descriptor for `version`.
    #[must_use]
    pub const fn for_version(version: MmuVersion) -> &'static Self {
        match version {
            MmuVersion::V1 => &Self::V1,
            MmuVersion::V2 => &Self::V2,
            MmuVersion::V3 => &Self::V3,
        }
    }

    #[must_use]
    pub fn level(&self, index: MmuLevelIndex) -> Option<&'static LevelDesc> {
        self.levels.iter().find(|l| l.index == index)
    }

    /// The level whose entries are leaves of page size `ps`.
    #[must_use]
    pub fn leaf_level(&self, ps: PageSize) -> Option<MmuLevelIndex> {
        self.levels
            .iter()
            .find(|l| l.leaf_page_size == Some(ps))
            .map(|l| l.index)
    }

    /// Page sizes this generation can map, smallest first.
    pub fn page_sizes(&self) -> impl Iterator<Item = PageSize> + '_ {
        PageSize::ALL
            .into_iter()
            .filter(|ps| self.leaf_level(*ps).is_some())
    }

    /// The level whose entries point at tables of `index`.
    #[must_use]
    pub fn parent(&self, index: MmuLevelIndex) -> Option<MmuLevelIndex> {
        match index {
            MmuLevelIndex::PteBig | MmuLevelIndex::PteSmall => Some(MmuLevelIndex::Pde0),
            _ => {
                let pos = self.levels.iter().position(|l| l.index == index)?;
                pos.checked_sub(1).map(|p| self.levels[p].index)
            }
        }
    }

    /// Levels from the root down to (and including) `leaf`, skipping the
    /// sibling PTE level that is not on the path.
    pub fn path_to(&self, leaf: MmuLevelIndex) -> impl Iterator<Item = &'static LevelDesc> + '_ {
        self.levels.iter().filter(move |l| {
            l.index <= leaf
                && !(leaf == MmuLevelIndex::PteSmall && l.index == MmuLevelIndex::PteBig)
        })
    }

    #[inline]
    #[must_use]
    pub const fn supports_atomic_disable(&self) -> bool {
        !matches!(self.version, MmuVersion::V1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_and_spans() {
        let pde0 = MmuFormat::V2.level(MmuLevelIndex::Pde0).unwrap();
        assert_eq!(pde0.coverage(), 2 << 20);
        assert_eq!(pde0.entries_per_table(), 256);
        assert_eq!(pde0.table_span(), 512 << 20);
        assert_eq!(pde0.table_bytes(), 4096);
        assert!(pde0.is_dual_purpose());
        assert!(pde0.is_dual_pde());

        let big = MmuFormat::V2.level(MmuLevelIndex::PteBig).unwrap();
        assert_eq!(big.entries_per_table(), 32);
        assert_eq!(big.table_span(), 2 << 20);
        assert!(big.is_leaf_only());
    }

    #[test]
    fn giant_pages_only_on_v3() {
        assert_eq!(MmuFormat::V2.leaf_level(PageSize::Size512M), None);
        assert_eq!(
            MmuFormat::V3.leaf_level(PageSize::Size512M),
            Some(MmuLevelIndex::Pde1)
        );
        assert_eq!(MmuFormat::V1.page_sizes().count(), 3);
        assert_eq!(MmuFormat::V3.page_sizes().count(), 4);
    }

    #[test]
    fn parents() {
        let f = &MmuFormat::V3;
        assert_eq!(f.parent(MmuLevelIndex::PteSmall), Some(MmuLevelIndex::Pde0));
        assert_eq!(f.parent(MmuLevelIndex::PteBig), Some(MmuLevelIndex::Pde0));
        assert_eq!(f.parent(MmuLevelIndex::Pde0), Some(MmuLevelIndex::Pde1));
        assert_eq!(f.parent(MmuLevelIndex::Pde4), None);
        assert_eq!(MmuFormat::V2.parent(MmuLevelIndex::Pde3), None);
    }

    #[test]
    fn path_skips_sibling() {
        let path: Vec<_> = MmuFormat::V2
            .path_to(MmuLevelIndex::PteSmall)
            .map(|l| l.index)
            .collect();
        assert_eq!(
            path,
            [
                MmuLevelIndex::Pde3,
                MmuLevelIndex::Pde2,
                MmuLevelIndex::Pde1,
                MmuLevelIndex::Pde0,
                MmuLevelIndex::PteSmall
            ]
        );
        let path: Vec<_> = MmuFormat::V3
            .path_to(MmuLevelIndex::Pde0)
            .map(|l| l.index)
            .collect();
        assert_eq!(path.len(), 5);
    }
}
