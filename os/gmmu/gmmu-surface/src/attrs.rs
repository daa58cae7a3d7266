//! # Attribute snapshots
//!
//! [`MemAttrs`] caches the decoded attributes of one mapping, per tree level
//! for GMMU mappings. Snapshots are taken when a mapping is discovered or
//! split and compared against the original ones to detect drift.
//!
//! Only the levels on the path to the *active* leaf take part in
//! comparisons: the sibling PTE level that is not in use holds whatever the
//! hardware left there.

use bitflags::bitflags;
use gmmu_addresses::{Aperture, PageSize};
use gmmu_format::{EntryRole, GmmuEntryBits, MmuFormat, MmuLevelIndex, MmuVersion};
use gmmu_tree::driver::SmmuPteFlags;
use gmmu_tree::segment::{EntryAttr, StagedEntry};
use gmmu_tree::{EntryOps, GmmuDriver, MmuLevelTree};
use utils_accessors_derive::Setters;

use crate::PmError;

bitflags! {
    /// Generation-independent mapping flags.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const VALID = 1 << 0;
        const CACHEABLE = 1 << 1;
        const SPARSE = 1 << 2;
        const READ_ONLY = 1 << 3;
        const ATOMIC_DISABLE = 1 << 4;
        const PRIVILEGED = 1 << 5;
        const ACE = 1 << 6;
    }
}

impl MapFlags {
    /// Flags `version` can express.
    #[must_use]
    pub const fn supported(version: MmuVersion) -> Self {
        match version {
            MmuVersion::V1 => Self::VALID
                .union(Self::CACHEABLE)
                .union(Self::SPARSE)
                .union(Self::READ_ONLY)
                .union(Self::PRIVILEGED),
            MmuVersion::V2 => Self::all().difference(Self::ACE),
            MmuVersion::V3 => Self::all(),
        }
    }

    /// Keep the bits of `self` selected by `keep`, take the rest from `other`.
    #[must_use]
    pub const fn merge(self, other: Self, keep: Self) -> Self {
        self.intersection(keep).union(other.difference(keep))
    }

    /// Leaf ops that make an entry carry exactly these flags on `version`.
    ///
    /// Flags the generation cannot express produce ops that
    /// [`modify_entries`](gmmu_tree::PmMmuLevel::modify_entries) rejects;
    /// their absence produces no op.
    #[must_use]
    pub fn entry_ops(self, version: MmuVersion) -> EntryOps {
        let supported = Self::supported(version);
        let pick = |flag: Self, set: EntryOps, clear: EntryOps| {
            if self.contains(flag) {
                set
            } else if supported.contains(flag) {
                clear
            } else {
                EntryOps::empty()
            }
        };
        pick(Self::VALID, EntryOps::SET_VALID, EntryOps::CLEAR_VALID)
            | pick(Self::CACHEABLE, EntryOps::SET_CACHE, EntryOps::CLEAR_CACHE)
            | pick(Self::SPARSE, EntryOps::SET_SPARSE, EntryOps::CLEAR_SPARSE)
            | pick(Self::READ_ONLY, EntryOps::SET_READ_ONLY, EntryOps::CLEAR_READ_ONLY)
            | pick(
                Self::ATOMIC_DISABLE,
                EntryOps::SET_ATOMIC_DISABLE,
                EntryOps::CLEAR_ATOMIC_DISABLE,
            )
            | pick(Self::PRIVILEGED, EntryOps::SET_PRIVILEGE, EntryOps::CLEAR_PRIVILEGE)
            | pick(Self::ACE, EntryOps::SET_ACE, EntryOps::CLEAR_ACE)
    }
}

/// Decoded attributes of one level's entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Setters)]
pub struct LevelAttrs {
    /// Whether the level was read (a table backs this offset).
    pub present: bool,
    pub valid: bool,
    pub cacheable: bool,
    pub sparse: bool,
    pub read_only: bool,
    pub atomic_disable: bool,
    pub privileged: bool,
    pub ace: bool,
}

impl LevelAttrs {
    /// Attributes of a leaf entry (`role` = PTE) or a directory pointer.
    #[must_use]
    pub const fn from_bits(bits: &GmmuEntryBits, role: EntryRole) -> Self {
        let leaf = matches!(role, EntryRole::Pte);
        Self {
            present: true,
            valid: bits.valid,
            cacheable: !bits.uncached,
            sparse: bits.sparse,
            read_only: leaf && bits.read_only,
            atomic_disable: leaf && bits.atomic_disable,
            privileged: leaf && bits.privilege,
            ace: leaf && bits.ace,
        }
    }

    #[must_use]
    pub fn flags(&self) -> MapFlags {
        let mut f = MapFlags::empty();
        f.set(MapFlags::VALID, self.valid);
        f.set(MapFlags::CACHEABLE, self.cacheable);
        f.set(MapFlags::SPARSE, self.sparse);
        f.set(MapFlags::READ_ONLY, self.read_only);
        f.set(MapFlags::ATOMIC_DISABLE, self.atomic_disable);
        f.set(MapFlags::PRIVILEGED, self.privileged);
        f.set(MapFlags::ACE, self.ace);
        f
    }

    #[must_use]
    pub const fn get(&self, attr: EntryAttr) -> bool {
        match attr {
            EntryAttr::Valid => self.valid,
            EntryAttr::Cached => self.cacheable,
            EntryAttr::Sparse => self.sparse,
            EntryAttr::ReadOnly => self.read_only,
            EntryAttr::AtomicDisable => self.atomic_disable,
            EntryAttr::Privilege => self.privileged,
            EntryAttr::Ace => self.ace,
        }
    }
}

const LEVELS: usize = 7;

/// Per-level snapshot of a GMMU mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GmmuAttrs {
    version: MmuVersion,
    page_size: PageSize,
    levels: [LevelAttrs; LEVELS],
}

impl GmmuAttrs {
    #[must_use]
    pub const fn new(version: MmuVersion, page_size: PageSize) -> Self {
        Self {
            version,
            page_size,
            levels: [LevelAttrs {
                present: false,
                valid: false,
                cacheable: false,
                sparse: false,
                read_only: false,
                atomic_disable: false,
                privileged: false,
                ace: false,
            }; LEVELS],
        }
    }

    /// Snapshot every level on the path to the `page_size` leaf at `offset`.
    ///
    /// # Errors
    /// Tree load errors.
    pub fn read(
        tree: &mut MmuLevelTree,
        driver: &dyn GmmuDriver,
        offset: u64,
        page_size: PageSize,
    ) -> Result<Self, PmError> {
        let format = tree.format();
        let mut attrs = Self::new(format.version, page_size);
        let leaf = leaf_index(format, page_size)?;
        for desc in format.path_to(leaf) {
            let Some(segment) = tree
                .level_mut(desc.index)
                .and_then(|l| l.segment_mut(offset))
            else {
                continue;
            };
            if !segment.is_attached() {
                continue;
            }
            let entry = segment.entry(driver, offset)?;
            attrs.init_level(desc.index, &entry, leaf);
        }
        Ok(attrs)
    }

    /// Record the decoded entry of `level`. On the way to a small-page leaf
    /// the PDE0 snapshot is taken from the small-table pointer.
    pub fn init_level(&mut self, level: MmuLevelIndex, entry: &StagedEntry, leaf: MmuLevelIndex) {
        let bits = if level == MmuLevelIndex::Pde0
            && leaf == MmuLevelIndex::PteSmall
            && entry.role == EntryRole::Pde
        {
            &entry.hi
        } else {
            &entry.lo
        };
        self.levels[level as usize] = LevelAttrs::from_bits(bits, entry.role);
    }

    #[inline]
    #[must_use]
    pub const fn version(&self) -> MmuVersion {
        self.version
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[must_use]
    pub const fn level(&self, index: MmuLevelIndex) -> &LevelAttrs {
        &self.levels[index as usize]
    }

    pub const fn level_mut(&mut self, index: MmuLevelIndex) -> &mut LevelAttrs {
        &mut self.levels[index as usize]
    }

    fn format(&self) -> &'static MmuFormat {
        MmuFormat::for_version(self.version)
    }

    /// Index of the active leaf level.
    ///
    /// # Errors
    /// [`PmError::Unsupported`] if the page size does not exist on this
    /// generation.
    pub fn leaf_index(&self) -> Result<MmuLevelIndex, PmError> {
        leaf_index(self.format(), self.page_size)
    }

    /// Attributes of the active leaf.
    #[must_use]
    pub fn leaf(&self) -> LevelAttrs {
        self.leaf_index().map(|i| self.levels[i as usize]).unwrap_or_default()
    }

    /// Same snapshot for `page_size`, carrying the leaf attributes over and
    /// clearing the previous leaf.
    #[must_use]
    pub fn with_page_size(&self, page_size: PageSize) -> Self {
        let mut next = *self;
        let leaf = self.leaf();
        if let Ok(old) = self.leaf_index() {
            next.levels[old as usize] = LevelAttrs::default();
        }
        next.page_size = page_size;
        if let Ok(new) = next.leaf_index() {
            next.levels[new as usize] = leaf;
        }
        next
    }

    /// Equality on the path to the active leaf only.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        if self.version != other.version || self.page_size != other.page_size {
            return false;
        }
        let Ok(leaf) = self.leaf_index() else {
            return false;
        };
        self.format()
            .path_to(leaf)
            .all(|d| self.levels[d.index as usize] == other.levels[d.index as usize])
    }
}

fn leaf_index(format: &MmuFormat, page_size: PageSize) -> Result<MmuLevelIndex, PmError> {
    format
        .leaf_level(page_size)
        .ok_or(PmError::Unsupported("page size not supported by this generation"))
}

/// Snapshot of an SMMU mapping: validity plus the raw flags.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SmmuAttrs {
    pub valid: bool,
    pub flags: SmmuPteFlags,
}

/// Snapshot of an ATS mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AtsAttrs {
    pub aperture: Aperture,
}

/// Attribute snapshot of one mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemAttrs {
    Gmmu(GmmuAttrs),
    Smmu(SmmuAttrs),
    Ats(AtsAttrs),
}

impl MemAttrs {
    /// Flags of the active translation.
    ///
    /// # Errors
    /// [`PmError::SoftwareError`] for ATS mappings, which have none.
    pub fn to_flags(&self) -> Result<MapFlags, PmError> {
        match self {
            Self::Gmmu(g) => Ok(g.leaf().flags()),
            Self::Smmu(s) => {
                let mut f = MapFlags::empty();
                f.set(MapFlags::VALID, s.valid);
                f.set(MapFlags::CACHEABLE, !s.flags.contains(SmmuPteFlags::UNCACHED));
                f.set(MapFlags::READ_ONLY, s.flags.contains(SmmuPteFlags::READ_ONLY));
                f.set(MapFlags::PRIVILEGED, s.flags.contains(SmmuPteFlags::PRIVILEGED));
                Ok(f)
            }
            Self::Ats(_) => Err(PmError::SoftwareError("ATS mappings have no page-table flags")),
        }
    }

    /// One decoded attribute of the active translation.
    ///
    /// # Errors
    /// - [`PmError::Unsupported`] for SMMU attributes other than validity.
    /// - [`PmError::SoftwareError`] for ATS mappings.
    pub fn get(&self, attr: EntryAttr) -> Result<bool, PmError> {
        match self {
            Self::Gmmu(g) => Ok(g.leaf().get(attr)),
            Self::Smmu(s) if attr == EntryAttr::Valid => Ok(s.valid),
            Self::Smmu(_) => Err(PmError::Unsupported("SMMU mappings only report validity")),
            Self::Ats(_) => Err(PmError::SoftwareError(
                "ATS mappings have no page-table attributes",
            )),
        }
    }

    /// Aperture of an ATS mapping.
    ///
    /// # Errors
    /// [`PmError::SoftwareError`] for other kinds.
    pub fn aperture(&self) -> Result<Aperture, PmError> {
        match self {
            Self::Ats(a) => Ok(a.aperture),
            _ => Err(PmError::SoftwareError("aperture is only tracked for ATS mappings")),
        }
    }

    /// Equality ignoring the inactive leaf level.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Gmmu(a), Self::Gmmu(b)) => a.is_same(b),
            (Self::Smmu(a), Self::Smmu(b)) => a == b,
            (Self::Ats(a), Self::Ats(b)) => a == b,
            _ => false,
        }
    }

    #[must_use]
    pub const fn as_gmmu(&self) -> Option<&GmmuAttrs> {
        match self {
            Self::Gmmu(g) => Some(g),
            _ => None,
        }
    }

    /// Overwrite the active leaf's attributes with `flags`.
    ///
    /// # Errors
    /// [`PmError::Unsupported`] for ATS mappings, which carry no flags, and
    /// for page sizes the generation lacks.
    pub fn set_flags(&mut self, flags: MapFlags) -> Result<(), PmError> {
        match self {
            Self::Gmmu(g) => {
                let leaf = g.leaf_index()?;
                *g.level_mut(leaf) = LevelAttrs {
                    present: true,
                    valid: flags.contains(MapFlags::VALID),
                    cacheable: flags.contains(MapFlags::CACHEABLE),
                    sparse: flags.contains(MapFlags::SPARSE),
                    read_only: flags.contains(MapFlags::READ_ONLY),
                    atomic_disable: flags.contains(MapFlags::ATOMIC_DISABLE),
                    privileged: flags.contains(MapFlags::PRIVILEGED),
                    ace: flags.contains(MapFlags::ACE),
                };
            }
            Self::Smmu(s) => {
                s.valid = flags.contains(MapFlags::VALID);
                s.flags.set(SmmuPteFlags::UNCACHED, !flags.contains(MapFlags::CACHEABLE));
                s.flags.set(SmmuPteFlags::READ_ONLY, flags.contains(MapFlags::READ_ONLY));
                s.flags.set(SmmuPteFlags::PRIVILEGED, flags.contains(MapFlags::PRIVILEGED));
            }
            Self::Ats(_) => {
                return Err(PmError::Unsupported("ATS mappings have no page-table flags"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gmmu_addresses::PhysicalAddress;

    fn leaf_entry(read_only: bool) -> StagedEntry {
        StagedEntry {
            role: EntryRole::Pte,
            lo: GmmuEntryBits::leaf(Aperture::Video, PhysicalAddress::new(0x20_0000))
                .with_read_only(read_only),
            hi: GmmuEntryBits::default(),
        }
    }

    #[test]
    fn inactive_leaf_level_is_ignored() {
        let mut a = GmmuAttrs::new(MmuVersion::V2, PageSize::Size64K);
        let mut b = a;
        a.init_level(MmuLevelIndex::PteBig, &leaf_entry(true), MmuLevelIndex::PteBig);
        b.init_level(MmuLevelIndex::PteBig, &leaf_entry(true), MmuLevelIndex::PteBig);
        // garbage in the small-page table
        b.init_level(MmuLevelIndex::PteSmall, &leaf_entry(false), MmuLevelIndex::PteSmall);
        assert_ne!(a, b);
        assert!(a.is_same(&b));

        b.level_mut(MmuLevelIndex::PteBig).set_read_only(false);
        assert!(!a.is_same(&b));
    }

    #[test]
    fn page_size_change_carries_leaf_over() {
        let mut a = GmmuAttrs::new(MmuVersion::V3, PageSize::Size2M);
        a.init_level(MmuLevelIndex::Pde0, &leaf_entry(true), MmuLevelIndex::Pde0);
        let b = a.with_page_size(PageSize::Size64K);
        assert_eq!(b.leaf(), a.leaf());
        assert!(!b.level(MmuLevelIndex::Pde0).present);
        assert!(b.leaf().read_only);
    }

    #[test]
    fn flags_to_ops() {
        let flags = MapFlags::VALID | MapFlags::CACHEABLE;
        let ops = flags.entry_ops(MmuVersion::V1);
        assert!(
            ops.contains(EntryOps::SET_VALID | EntryOps::SET_CACHE | EntryOps::CLEAR_READ_ONLY)
        );
        assert!(!ops.intersects(EntryOps::CLEAR_ATOMIC_DISABLE | EntryOps::CLEAR_ACE));

        let ops = (flags | MapFlags::ACE).entry_ops(MmuVersion::V2);
        assert!(ops.contains(EntryOps::SET_ACE));
    }

    #[test]
    fn merge_keeps_selected_bits() {
        let mine = MapFlags::VALID | MapFlags::READ_ONLY;
        let donor = MapFlags::VALID | MapFlags::CACHEABLE;
        assert_eq!(
            mine.merge(donor, MapFlags::READ_ONLY),
            MapFlags::VALID | MapFlags::READ_ONLY | MapFlags::CACHEABLE
        );
        assert_eq!(mine.merge(donor, MapFlags::empty()), donor);
    }

    #[test]
    fn ats_and_smmu_queries() {
        let ats = MemAttrs::Ats(AtsAttrs {
            aperture: Aperture::SysCoherent,
        });
        assert_eq!(ats.aperture(), Ok(Aperture::SysCoherent));
        assert!(matches!(ats.to_flags(), Err(PmError::SoftwareError(_))));

        let smmu = MemAttrs::Smmu(SmmuAttrs {
            valid: true,
            flags: SmmuPteFlags::READ_ONLY,
        });
        assert_eq!(smmu.get(EntryAttr::Valid), Ok(true));
        assert!(matches!(smmu.get(EntryAttr::Sparse), Err(PmError::Unsupported(_))));
        assert_eq!(
            smmu.to_flags(),
            Ok(MapFlags::VALID | MapFlags::CACHEABLE | MapFlags::READ_ONLY)
        );
    }

    #[test]
    fn flags_cannot_be_set_on_ats_mappings() {
        let mut ats = MemAttrs::Ats(AtsAttrs {
            aperture: Aperture::SysCoherent,
        });
        assert!(matches!(ats.set_flags(MapFlags::VALID), Err(PmError::Unsupported(_))));

        let mut gmmu = MemAttrs::Gmmu(GmmuAttrs::new(MmuVersion::V2, PageSize::Size4K));
        gmmu.set_flags(MapFlags::VALID | MapFlags::READ_ONLY).unwrap();
        assert_eq!(gmmu.to_flags(), Ok(MapFlags::VALID | MapFlags::READ_ONLY));
    }
}
