//! # Level segments
//!
//! A [`MmuLevelSegment`] mirrors one contiguous run of entries of one table,
//! clipped to the part of the surface that table translates. Entries are read
//! from hardware on first touch and kept as decoded [`StagedEntry`] values;
//! mutations change the staged values only and mark them dirty, and
//! [`flush`](MmuLevelSegment::flush) serializes dirty entries back to raw bytes.
//!
//! A segment without a table (a *detached* segment) keeps the level's
//! partition of the surface complete where no table exists; every entry
//! access on it fails with [`MmuError::NoPageTable`].
//!
//! ## Offsets
//!
//! All public methods take *surface offsets*. Entry `i` of a segment
//! translates the VA range starting at `first_va + i * coverage`, where
//! `first_va` is the segment start aligned down to the entry coverage.

use crate::channel::{CommandChannel, CopyEngine, PhysTarget};
use crate::{GmmuDriver, MmuError};
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use gmmu_addresses::{
    Aperture, GpuVirtualAddress, PageSize, PhysicalAddress, align_down, is_aligned,
};
use gmmu_format::pcf::PcfRequest;
use gmmu_format::{EntryRole, GmmuEntryBits, LevelDesc, MmuLevelIndex, MmuVersion, entry};

/// Where a table lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableLocation {
    pub aperture: Aperture,
    pub base: PhysicalAddress,
}

/// Decoded contents of one entry slot.
///
/// For the dual PDE0, `lo` is the big-table pointer or the 2 MiB leaf and
/// `hi` is the small-table pointer. Other levels only use `lo`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StagedEntry {
    /// Interpretation of `lo`. `hi` is always a directory pointer.
    pub role: EntryRole,
    pub lo: GmmuEntryBits,
    pub hi: GmmuEntryBits,
}

/// Which pointer of a directory slot to use.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PdeHalf {
    /// Big-page table in a dual PDE, the only pointer elsewhere.
    Lo,
    /// Small-page table in a dual PDE.
    Hi,
}

impl PdeHalf {
    /// The half of a parent entry that points at tables of `lower`.
    #[must_use]
    pub const fn for_lower(lower: MmuLevelIndex) -> Self {
        match lower {
            MmuLevelIndex::PteSmall => Self::Hi,
            _ => Self::Lo,
        }
    }
}

/// Base for a PCF rewrite.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PcfFetch {
    /// Start from the attributes currently staged.
    FetchCache,
    /// Start from an empty PCF.
    Reset,
}

/// One boolean attribute of a leaf entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryAttr {
    Valid,
    Cached,
    Sparse,
    ReadOnly,
    AtomicDisable,
    Privilege,
    Ace,
}

pub struct MmuLevelSegment {
    desc: &'static LevelDesc,
    version: MmuVersion,
    virt_base: GpuVirtualAddress,
    start: u64,
    end: u64,
    table: Option<TableLocation>,
    seed_role: EntryRole,
    entries: Vec<StagedEntry>,
    dirty: Vec<bool>,
}

impl MmuLevelSegment {
    /// A segment over `[start, end)` of a surface based at `virt_base`.
    ///
    /// `active` seeds the role of ambiguous dual-purpose entries: slots of a
    /// level whose leaf page size equals `active` are read as leaves unless
    /// their bits say otherwise.
    #[must_use]
    pub fn new(
        desc: &'static LevelDesc,
        version: MmuVersion,
        virt_base: GpuVirtualAddress,
        range: Range<u64>,
        table: Option<TableLocation>,
        active: PageSize,
    ) -> Self {
        debug_assert!(range.start < range.end);
        let seed_role = if desc.is_leaf_only() || (desc.leaf_page_size == Some(active)) {
            EntryRole::Pte
        } else {
            EntryRole::Pde
        };
        Self {
            desc,
            version,
            virt_base,
            start: range.start,
            end: range.end,
            table,
            seed_role,
            entries: Vec::new(),
            dirty: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn level(&self) -> MmuLevelIndex {
        self.desc.index
    }

    #[inline]
    #[must_use]
    pub const fn desc(&self) -> &'static LevelDesc {
        self.desc
    }

    /// Surface offsets covered by this segment.
    #[inline]
    #[must_use]
    pub const fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    #[inline]
    #[must_use]
    pub const fn table(&self) -> Option<TableLocation> {
        self.table
    }

    #[inline]
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.table.is_some()
    }

    #[inline]
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        !self.entries.is_empty()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.iter().any(|d| *d)
    }

    /// Extend an adjacent, untouched segment of the same table.
    pub(crate) fn try_merge(&mut self, next: &Self) -> bool {
        if self.end != next.start
            || self.table != next.table
            || self.is_loaded()
            || next.is_loaded()
        {
            return false;
        }
        self.end = next.end;
        true
    }

    fn first_va(&self) -> u64 {
        align_down(self.virt_base.as_u64() + self.start, self.desc.coverage())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn local_index(&self, offset: u64) -> usize {
        ((self.virt_base.as_u64() + offset - self.first_va()) >> self.desc.va_lo) as usize
    }

    /// Number of entries in the segment.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.local_index(self.end - 1) + 1
    }

    /// VA translated by the start of entry `i`.
    fn entry_va(&self, i: usize) -> u64 {
        self.first_va() + ((i as u64) << self.desc.va_lo)
    }

    fn entry_address_at_unchecked(&self, table: TableLocation, offset: u64) -> PhysicalAddress {
        let index = self.desc.index_of(self.virt_base + offset);
        table.base + index * u64::from(self.desc.entry_size)
    }

    /// Physical location of the entry translating `offset`.
    #[must_use]
    pub fn entry_address_at(&self, offset: u64) -> Option<PhysicalAddress> {
        self.table.map(|t| self.entry_address_at_unchecked(t, offset))
    }

    fn require_table(&self, offset: u64) -> Result<TableLocation, MmuError> {
        self.table.ok_or(MmuError::NoPageTable {
            level: self.desc.index,
            offset,
        })
    }

    /// Entries touched by `[offset, offset + size)` clipped to the segment,
    /// and the clipped length.
    ///
    /// # Errors
    /// [`MmuError::InvalidArgument`] if `offset` lies outside the segment or
    /// `size` is zero.
    pub fn span(&self, offset: u64, size: u64) -> Result<(Range<usize>, u64), MmuError> {
        if !self.contains(offset) || size == 0 {
            return Err(MmuError::InvalidArgument("offset outside segment"));
        }
        let covered = size.min(self.end - offset);
        let first = self.local_index(offset);
        let last = self.local_index(offset + covered - 1);
        Ok((first..last + 1, covered))
    }

    /// Read and decode every entry from subdevice 0, once.
    ///
    /// # Errors
    /// [`MmuError::NoPageTable`] on detached segments, driver and decode errors.
    pub fn load(&mut self, driver: &dyn GmmuDriver) -> Result<(), MmuError> {
        if self.is_loaded() {
            return Ok(());
        }
        let table = self.require_table(self.start)?;
        let count = self.entry_count();
        let entry_size = self.desc.entry_size as usize;
        let mut raw = vec![0u8; count * entry_size];
        let base = self.entry_address_at_unchecked(table, self.start);
        driver.read_phys(0, table.aperture, base, &mut raw)?;

        let mut entries = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(entry_size) {
            let lo = u64_at(chunk, 0);
            let mut staged = self.decode_slot(lo)?;
            if self.desc.is_dual_pde() {
                staged.hi = GmmuEntryBits::decode(self.version, EntryRole::Pde, u64_at(chunk, 8))?;
            }
            entries.push(staged);
        }

        log::trace!(
            "loaded {} {:?} entries at {:?} {base:?}",
            count,
            self.desc.index,
            table.aperture
        );
        self.dirty = vec![false; count];
        self.entries = entries;
        Ok(())
    }

    /// Classify and decode the lo word of a slot.
    fn decode_slot(&self, raw: u64) -> Result<StagedEntry, MmuError> {
        let decode = |role| {
            GmmuEntryBits::decode(self.version, role, raw).map(|lo| StagedEntry {
                role,
                lo,
                ..StagedEntry::default()
            })
        };

        if !self.desc.is_dual_purpose() {
            return Ok(decode(self.seed_role)?);
        }
        if entry::is_valid_leaf(raw) {
            return Ok(decode(EntryRole::Pte)?);
        }
        let other = match self.seed_role {
            EntryRole::Pte => EntryRole::Pde,
            EntryRole::Pde => EntryRole::Pte,
        };
        match decode(self.seed_role) {
            Ok(e) => Ok(e),
            Err(_) => Ok(decode(other)?),
        }
    }

    /// Staged entry translating `offset`.
    ///
    /// # Errors
    /// See [`load`](Self::load) and [`span`](Self::span).
    pub fn entry(&mut self, driver: &dyn GmmuDriver, offset: u64) -> Result<StagedEntry, MmuError> {
        self.require_table(offset)?;
        let (range, _) = self.span(offset, 1)?;
        self.load(driver)?;
        Ok(self.entries[range.start])
    }

    /// Apply `f` to every entry of the span, normalizing each result to what
    /// hardware would read back. Entries are committed one by one; the first
    /// error stops the pass.
    fn update<F>(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        mut f: F,
    ) -> Result<u64, MmuError>
    where
        F: FnMut(&mut StagedEntry, usize) -> Result<(), MmuError>,
    {
        self.require_table(offset)?;
        let (range, covered) = self.span(offset, size)?;
        self.load(driver)?;

        for i in range {
            let mut e = self.entries[i];
            f(&mut e, i)?;
            e.lo = e.lo.normalized(self.version, e.role)?;
            if self.desc.is_dual_pde() {
                e.hi = e.hi.normalized(self.version, EntryRole::Pde)?;
            }
            if e != self.entries[i] {
                self.entries[i] = e;
                self.dirty[i] = true;
            }
        }
        Ok(covered)
    }

    fn require_independent_bits(&self) -> Result<(), MmuError> {
        if self.version.uses_pcf() {
            Err(MmuError::Unsupported(
                "individual attribute bits do not exist on packed-PCF formats",
            ))
        } else {
            Ok(())
        }
    }

    /// Set or clear VALID on leaves; on directories only clearing is
    /// allowed (it unmaps every pointer of the slot).
    ///
    /// # Errors
    /// [`MmuError::BadParameter`] when validating a directory slot; use
    /// [`connect_lower`](Self::connect_lower) instead.
    pub fn set_valid(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        valid: bool,
    ) -> Result<u64, MmuError> {
        self.update(driver, offset, size, |e, _| match e.role {
            EntryRole::Pte => {
                e.lo.valid = valid;
                if valid {
                    e.lo.sparse = false;
                }
                Ok(())
            }
            EntryRole::Pde if valid => Err(MmuError::BadParameter(
                "directory entries are validated by connecting a table",
            )),
            EntryRole::Pde => {
                for half in [&mut e.lo, &mut e.hi] {
                    half.valid = false;
                    half.aperture = Aperture::Invalid;
                }
                Ok(())
            }
        })
    }

    /// # Errors
    /// [`MmuError::Unsupported`] on packed-PCF formats.
    pub fn set_cache(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        cached: bool,
    ) -> Result<u64, MmuError> {
        self.require_independent_bits()?;
        self.update(driver, offset, size, |e, _| {
            e.lo.uncached = !cached;
            if e.role == EntryRole::Pde {
                e.hi.uncached = !cached;
            }
            Ok(())
        })
    }

    /// Sparse is a state of invalid entries: setting it clears VALID.
    ///
    /// # Errors
    /// [`MmuError::Unsupported`] on packed-PCF formats.
    pub fn set_sparse(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        sparse: bool,
    ) -> Result<u64, MmuError> {
        self.require_independent_bits()?;
        self.update(driver, offset, size, |e, _| {
            let directory = e.role == EntryRole::Pde;
            let halves = if directory { 2 } else { 1 };
            for half in [&mut e.lo, &mut e.hi].into_iter().take(halves) {
                if sparse {
                    half.valid = false;
                    if directory {
                        half.aperture = Aperture::Invalid;
                    }
                }
                half.sparse = sparse;
            }
            Ok(())
        })
    }

    fn update_leaf<F>(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        mut f: F,
    ) -> Result<u64, MmuError>
    where
        F: FnMut(&mut GmmuEntryBits),
    {
        self.require_independent_bits()?;
        self.update(driver, offset, size, |e, _| {
            if e.role != EntryRole::Pte {
                return Err(MmuError::BadParameter("attribute only exists on leaf entries"));
            }
            f(&mut e.lo);
            Ok(())
        })
    }

    /// # Errors
    /// [`MmuError::Unsupported`] on V1 and on packed-PCF formats.
    pub fn set_atomic_disable(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        disable: bool,
    ) -> Result<u64, MmuError> {
        if self.version == MmuVersion::V1 {
            return Err(MmuError::Unsupported("atomic disable does not exist on V1"));
        }
        self.update_leaf(driver, offset, size, |lo| lo.atomic_disable = disable)
    }

    /// # Errors
    /// [`MmuError::Unsupported`] on packed-PCF formats.
    pub fn set_read_only(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        read_only: bool,
    ) -> Result<u64, MmuError> {
        self.update_leaf(driver, offset, size, |lo| lo.read_only = read_only)
    }

    /// # Errors
    /// [`MmuError::Unsupported`] on packed-PCF formats.
    pub fn set_privilege(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        privileged: bool,
    ) -> Result<u64, MmuError> {
        self.update_leaf(driver, offset, size, |lo| lo.privilege = privileged)
    }

    /// Rewrite the PCF of every entry in the span.
    ///
    /// The base is the staged PCF ([`PcfFetch::FetchCache`]) or empty
    /// ([`PcfFetch::Reset`]); `request` is applied on top and bits that do not
    /// apply to the entry's valid/invalid state are trimmed before encoding.
    ///
    /// # Errors
    /// [`MmuError::Format`] if the result has no hardware encoding.
    pub fn set_pcf(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        request: &PcfRequest,
        fetch: PcfFetch,
    ) -> Result<u64, MmuError> {
        let version = self.version;
        self.update(driver, offset, size, |e, _| {
            match e.role {
                EntryRole::Pte => {
                    let valid = e.lo.valid;
                    let base = match fetch {
                        PcfFetch::FetchCache => e.lo.pte_pcf().trim(valid),
                        PcfFetch::Reset => gmmu_format::SwPtePcf::empty(),
                    };
                    let sw = request.apply_pte(base).trim(valid);
                    log::trace!("{version:?} PTE PCF {base:?} -> {sw:?} (valid={valid})");
                    e.lo.set_pte_pcf(sw);
                }
                EntryRole::Pde => {
                    for half in [&mut e.lo, &mut e.hi] {
                        let valid = half.valid;
                        let base = match fetch {
                            PcfFetch::FetchCache => half.pde_pcf().trim(valid),
                            PcfFetch::Reset => gmmu_format::SwPdePcf::empty(),
                        };
                        half.set_pde_pcf(request.apply_pde(base).trim(valid));
                    }
                }
            }
            Ok(())
        })
    }

    /// Point the span's leaves at physically contiguous memory starting with
    /// `address` for the entry at `offset`.
    ///
    /// # Errors
    /// - [`MmuError::InvalidArgument`] if `offset` or `address` is not aligned
    ///   to the entry coverage.
    /// - [`MmuError::BadParameter`] on directory entries.
    pub fn set_contiguous_phys(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        aperture: Aperture,
        address: PhysicalAddress,
    ) -> Result<u64, MmuError> {
        let coverage = self.desc.coverage();
        if !is_aligned(self.virt_base.as_u64() + offset, coverage)
            || !address.is_aligned_to(coverage)
        {
            return Err(MmuError::InvalidArgument("physical remap must start on an entry boundary"));
        }
        let first = self.local_index(offset);
        self.update(driver, offset, size, |e, i| {
            if e.role != EntryRole::Pte {
                return Err(MmuError::BadParameter("cannot map memory through a directory entry"));
            }
            e.lo.aperture = aperture;
            e.lo.address = address + ((i - first) as u64) * coverage;
            Ok(())
        })
    }

    /// Switch dual-purpose slots between leaf and directory. Both pointer
    /// halves are cleared.
    ///
    /// # Errors
    /// [`MmuError::BadParameter`] on levels that are not dual-purpose.
    pub fn retype(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        role: EntryRole,
    ) -> Result<u64, MmuError> {
        if !self.desc.is_dual_purpose() {
            return Err(MmuError::BadParameter("level is not dual-purpose"));
        }
        log::debug!("retype {:?} [{offset:#x}+{size:#x}) to {role:?}", self.desc.index);
        self.update(driver, offset, size, |e, _| {
            *e = StagedEntry { role, ..StagedEntry::default() };
            Ok(())
        })
    }

    /// Attach `table` to one pointer half of each directory slot in the span.
    ///
    /// # Errors
    /// [`MmuError::BadParameter`] on leaf entries or for [`PdeHalf::Hi`] on
    /// single-pointer levels.
    pub fn connect_lower(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        half: PdeHalf,
        table: TableLocation,
    ) -> Result<u64, MmuError> {
        if half == PdeHalf::Hi && !self.desc.is_dual_pde() {
            return Err(MmuError::BadParameter("level has a single pointer per entry"));
        }
        self.update(driver, offset, size, |e, _| {
            if e.role != EntryRole::Pde {
                return Err(MmuError::BadParameter("cannot connect a table below a leaf entry"));
            }
            let target = match half {
                PdeHalf::Lo => &mut e.lo,
                PdeHalf::Hi => &mut e.hi,
            };
            *target = GmmuEntryBits::table(table.aperture, table.base);
            Ok(())
        })
    }

    /// Whether the slot translating `offset` is a leaf.
    ///
    /// On dual-purpose levels an unmapped slot is ambiguous in hardware; the
    /// staged role (seeded from the active page size, updated by
    /// [`retype`](Self::retype)) decides.
    ///
    /// # Errors
    /// See [`entry`](Self::entry).
    pub fn is_leaf(&mut self, driver: &dyn GmmuDriver, offset: u64) -> Result<bool, MmuError> {
        Ok(self.entry(driver, offset)?.role == EntryRole::Pte)
    }

    /// Decoded value of one leaf attribute.
    ///
    /// # Errors
    /// - [`MmuError::Unsupported`] for atomic-disable on V1 and ACE before V3.
    /// - [`MmuError::BadParameter`] on directory entries.
    pub fn get_attr(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        attr: EntryAttr,
    ) -> Result<bool, MmuError> {
        match (self.version, attr) {
            (MmuVersion::V1, EntryAttr::AtomicDisable) => {
                return Err(MmuError::Unsupported("atomic disable does not exist on V1"));
            }
            (MmuVersion::V1 | MmuVersion::V2, EntryAttr::Ace) => {
                return Err(MmuError::Unsupported("access counting requires a packed PCF"));
            }
            _ => {}
        }
        let e = self.entry(driver, offset)?;
        if e.role != EntryRole::Pte {
            return Err(MmuError::BadParameter("attribute only exists on leaf entries"));
        }
        Ok(match attr {
            EntryAttr::Valid => e.lo.valid,
            EntryAttr::Cached => !e.lo.uncached,
            EntryAttr::Sparse => e.lo.sparse,
            EntryAttr::ReadOnly => e.lo.read_only,
            EntryAttr::AtomicDisable => e.lo.atomic_disable,
            EntryAttr::Privilege => e.lo.privilege,
            EntryAttr::Ace => e.lo.ace,
        })
    }

    /// Aperture and physical address `offset` translates to through this
    /// leaf, or the table a directory slot points at.
    ///
    /// # Errors
    /// See [`entry`](Self::entry).
    pub fn get_phys(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
    ) -> Result<(Aperture, PhysicalAddress), MmuError> {
        let e = self.entry(driver, offset)?;
        match e.role {
            EntryRole::Pte => {
                let within = (self.virt_base.as_u64() + offset) & (self.desc.coverage() - 1);
                Ok((e.lo.aperture, e.lo.address + within))
            }
            EntryRole::Pde => Ok((e.lo.aperture, e.lo.address)),
        }
    }

    /// Serialize dirty entries to hardware, directly on every subdevice or as
    /// 4-byte copy-engine patches on `channel`. Returns the number of entries
    /// written.
    ///
    /// # Errors
    /// Encode, driver and channel errors. Entries written before the error
    /// stay written.
    pub fn flush(
        &mut self,
        driver: &dyn GmmuDriver,
        channel: Option<&mut (dyn CommandChannel + '_)>,
    ) -> Result<usize, MmuError> {
        let Some(table) = self.table else {
            return Ok(0);
        };
        if !self.is_dirty() {
            return Ok(0);
        }

        let entry_size = self.desc.entry_size as usize;
        let base = self.entry_address_at_unchecked(table, self.start);
        let mut written = 0;
        let mut channel = channel;
        let in_band = channel.is_some();

        let mut i = 0;
        while i < self.entries.len() {
            if !self.dirty[i] {
                i += 1;
                continue;
            }
            let run_end = (i..self.entries.len())
                .find(|&j| !self.dirty[j])
                .unwrap_or(self.entries.len());
            let mut bytes = Vec::with_capacity((run_end - i) * entry_size);
            for e in &self.entries[i..run_end] {
                bytes.extend_from_slice(&e.lo.encode(self.version, e.role)?.to_le_bytes());
                if self.desc.is_dual_pde() {
                    let hi = e.hi.encode(self.version, EntryRole::Pde)?;
                    bytes.extend_from_slice(&hi.to_le_bytes());
                }
            }

            let at = base + (i * entry_size) as u64;
            match channel.as_deref_mut() {
                Some(ch) => {
                    for (k, word) in bytes.chunks_exact(4).enumerate() {
                        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                        let dst = PhysTarget::new(table.aperture, at + (k * 4) as u64);
                        CopyEngine::patch_u32(ch, dst, value)?;
                    }
                }
                None => driver.broadcast_phys(table.aperture, at, &bytes)?,
            }

            for d in &mut self.dirty[i..run_end] {
                *d = false;
            }
            written += run_end - i;
            i = run_end;
        }

        log::debug!(
            "flushed {written} {:?} entries of [{:#x}, {:#x}) {}",
            self.desc.index,
            self.start,
            self.end,
            if in_band { "in-band" } else { "directly" }
        );
        Ok(written)
    }

    /// Drop staged entries so the next access re-reads hardware.
    ///
    /// # Errors
    /// [`MmuError::SoftwareError`] if unflushed changes would be lost.
    pub fn discard(&mut self) -> Result<(), MmuError> {
        if self.is_dirty() {
            return Err(MmuError::SoftwareError("discarding unflushed entries"));
        }
        self.entries.clear();
        self.dirty.clear();
        Ok(())
    }

    /// Surface offset where entry `i` starts, clipped to the segment.
    #[must_use]
    pub fn entry_offset(&self, i: usize) -> u64 {
        (self.entry_va(i) - self.virt_base.as_u64()).max(self.start)
    }
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

impl core::fmt::Debug for MmuLevelSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmuLevelSegment")
            .field("level", &self.desc.index)
            .field("range", &(self.start..self.end))
            .field("table", &self.table)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}
