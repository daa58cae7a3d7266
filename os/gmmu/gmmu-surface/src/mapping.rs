//! # Mappings
//!
//! A [`PmMemMapping`] is a run of a surface that is physically contiguous,
//! uses one page size and carries one set of attributes. Mappings are split
//! to edit part of them and joined back when they agree again.
//!
//! Retargeting a GMMU mapping between page sizes rewrites up to three levels:
//!
//! | From → to | PDE0 | Old leaf | New leaf |
//! |:----------|:-----|:---------|:---------|
//! | 2M → 64K/4K | retype to directory, connect the new table | (the PDE0 leaf) | phys + flags |
//! | 64K/4K → 2M | retype to leaf, phys + flags | invalidated | (the PDE0 leaf) |
//! | 64K ↔ 4K | clear pointers (unless dual page size), connect the new table | invalidated | phys + flags |
//!
//! Any other transition is refused with [`PmError::PageSizeTransition`].

use crate::attrs::{GmmuAttrs, MapFlags, MemAttrs, SmmuAttrs};
use crate::helper::PmMemMappingsHelper;
use crate::{JoinMismatch, PmError, PmMemRange};
use alloc::boxed::Box;
use alloc::vec::Vec;
use gmmu_addresses::{
    Aperture, GpuVirtualAddress, MemHandle, PageSize, PhysicalAddress, VaSpaceHandle, is_aligned,
};
use gmmu_format::{EntryRole, MmuLevelIndex};
use gmmu_tree::driver::{InvalidateTlbParams, PteInfo, SetPteInfoParams};
use gmmu_tree::segment::PdeHalf;
use gmmu_tree::{EntryArgs, EntryOps, GmmuDriver, MmuLevelTree, WriteMode};

/// How a mapping is translated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MappingKind {
    /// Through the GPU page tables mirrored by the tree.
    Gmmu,
    /// Through system-MMU page tables, reachable per page via the driver.
    Smmu,
    /// Through ATS; no page-table entry exists.
    Ats,
}

/// Physical memory behind a mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Backing {
    pub mem_handle: MemHandle,
    /// Offset inside the allocation.
    pub mem_offset: u64,
    pub aperture: Aperture,
    pub phys: PhysicalAddress,
}

impl Backing {
    /// The same backing `delta` bytes further in.
    #[must_use]
    pub fn advance(self, delta: u64) -> Self {
        Self {
            mem_offset: self.mem_offset + delta,
            phys: self.phys + delta,
            ..self
        }
    }

    /// Whether `next` continues this backing after `len` bytes.
    #[must_use]
    pub fn continues_with(&self, len: u64, next: &Self) -> bool {
        self.aperture == next.aperture && self.phys + len == next.phys
    }
}

/// Everything a mapping needs to rewrite its translation.
pub struct MapCtx<'a, 'c> {
    pub driver: &'a dyn GmmuDriver,
    /// Present for GMMU address spaces.
    pub tree: Option<&'a mut MmuLevelTree>,
    pub vaspace: VaSpaceHandle,
    pub virt_base: GpuVirtualAddress,
    pub mode: &'a mut WriteMode<'c>,
    /// Keep both PDE0 pointers connected when switching between 4K and 64K.
    pub dual_page_size: bool,
}

impl MapCtx<'_, '_> {
    fn modify(
        &mut self,
        level: MmuLevelIndex,
        offset: u64,
        size: u64,
        ops: EntryOps,
        args: &EntryArgs<'_>,
    ) -> Result<(), PmError> {
        let tree = self
            .tree
            .as_deref_mut()
            .ok_or(PmError::SoftwareError("GMMU mapping without a tree"))?;
        tree.pm_level(level)?
            .modify_entries(self.driver, offset, size, ops, args, self.mode)?;
        Ok(())
    }

    fn tree(&mut self) -> Result<&mut MmuLevelTree, PmError> {
        self.tree
            .as_deref_mut()
            .ok_or(PmError::SoftwareError("GMMU mapping without a tree"))
    }

    /// Invalidate the `page_size` leaf entries of `[offset, offset + size)`
    /// wherever a table exists.
    pub(crate) fn clear_leaf(
        &mut self,
        page_size: PageSize,
        offset: u64,
        size: u64,
    ) -> Result<(), PmError> {
        let tree = self.tree()?;
        let Some(leaf) = tree.format().leaf_level(page_size) else {
            return Ok(());
        };
        let end = offset + size;
        let spans: Vec<(u64, u64)> = tree
            .lower_tables(leaf)
            .iter()
            .filter(|t| t.start < end && offset < t.end)
            .map(|t| (t.start.max(offset), t.end.min(end)))
            .collect();
        for (start, stop) in spans {
            self.modify(leaf, start, stop - start, EntryOps::CLEAR_VALID, &EntryArgs::default())?;
        }
        Ok(())
    }

    fn invalidate_after_driver_writes(&mut self) -> Result<(), PmError> {
        if self.mode.defer_tlb_invalidate || self.mode.is_in_band() {
            self.mode.invalidate_pending = true;
        } else {
            self.driver
                .invalidate_tlb(&InvalidateTlbParams { vaspace: self.vaspace })?;
        }
        Ok(())
    }
}

/// Whether `from → to` can be done in one step.
///
/// # Errors
/// [`PmError::PageSizeTransition`] otherwise.
pub fn check_transition(from: PageSize, to: PageSize) -> Result<(), PmError> {
    use PageSize::{Size2M, Size4K, Size64K};
    match (from, to) {
        _ if from == to => Ok(()),
        (Size2M, Size4K | Size64K) | (Size4K | Size64K, Size2M | Size4K | Size64K) => Ok(()),
        _ => Err(PmError::PageSizeTransition { from, to }),
    }
}

/// One uniform run of a surface.
#[derive(Clone, Debug)]
pub struct PmMemMapping {
    range: PmMemRange,
    page_size: PageSize,
    backing: Backing,
    kind: MappingKind,
    attrs: MemAttrs,
    children: Option<Box<PmMemMappingsHelper>>,
}

impl PmMemMapping {
    #[must_use]
    pub const fn new(
        range: PmMemRange,
        page_size: PageSize,
        backing: Backing,
        kind: MappingKind,
        attrs: MemAttrs,
    ) -> Self {
        Self {
            range,
            page_size,
            backing,
            kind,
            attrs,
            children: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PmMemRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.range.offset
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.range.size
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.range.end()
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> PageSize {
        self.page_size
    }

    #[inline]
    #[must_use]
    pub const fn backing(&self) -> Backing {
        self.backing
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> MappingKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn attrs(&self) -> &MemAttrs {
        &self.attrs
    }

    /// Sub-mappings of an ATS mapping that also has GMMU translations.
    #[must_use]
    pub fn children(&self) -> Option<&PmMemMappingsHelper> {
        self.children.as_deref()
    }

    pub fn children_mut(&mut self) -> Option<&mut PmMemMappingsHelper> {
        self.children.as_deref_mut()
    }

    /// Extend by `len` bytes of the same backing.
    pub(crate) const fn grow(&mut self, len: u64) {
        self.range.size += len;
    }

    pub(crate) fn set_children(&mut self, children: PmMemMappingsHelper) {
        self.children = Some(Box::new(children));
    }

    /// Mappings stored in this one, itself included.
    #[must_use]
    pub fn count(&self) -> usize {
        1 + self.children.as_ref().map_or(0, |c| c.count())
    }

    /// Same range, page size, backing and attributes (ignoring the inactive
    /// leaf level).
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        self.range == other.range
            && self.page_size == other.page_size
            && self.backing == other.backing
            && self.kind == other.kind
            && self.attrs.is_same(&other.attrs)
    }

    /// Split at surface offset `at`; `self` keeps the lower part.
    ///
    /// # Errors
    /// [`PmError::InvalidArgument`] unless `at` is strictly inside the mapping
    /// on a page boundary.
    pub fn split(&mut self, at: u64) -> Result<Self, PmError> {
        if at <= self.offset() || at >= self.end() {
            return Err(PmError::InvalidArgument("split point outside mapping"));
        }
        let delta = at - self.offset();
        if !is_aligned(delta, self.page_size.bytes()) {
            return Err(PmError::InvalidArgument("split point not on a page boundary"));
        }

        let upper_children = match self.children.as_deref_mut() {
            Some(children) => Some(Box::new(children.split_off(at)?)),
            None => None,
        };
        let upper = Self {
            range: PmMemRange::new(self.range.surface, at, self.end() - at),
            page_size: self.page_size,
            backing: self.backing.advance(delta),
            kind: self.kind,
            attrs: self.attrs,
            children: upper_children,
        };
        self.range.size = delta;
        log::debug!("split mapping at {at:#x}: {:?} | {:?}", self.range, upper.range);
        Ok(upper)
    }

    /// Whether `next` could be appended to `self`.
    ///
    /// # Errors
    /// The first [`JoinMismatch`] found.
    pub fn can_join(&self, next: &Self) -> Result<(), JoinMismatch> {
        if self.range.surface != next.range.surface {
            return Err(JoinMismatch::Surface);
        }
        if self.end() != next.offset() {
            return Err(JoinMismatch::NotAdjacent);
        }
        if self.kind != next.kind {
            return Err(JoinMismatch::Kind);
        }
        if self.page_size != next.page_size {
            return Err(JoinMismatch::PageSize);
        }
        if self.backing.mem_handle != next.backing.mem_handle {
            return Err(JoinMismatch::Handle);
        }
        if self.backing.mem_offset + self.size() != next.backing.mem_offset {
            return Err(JoinMismatch::MemOffset);
        }
        if !self.backing.continues_with(self.size(), &next.backing) {
            return Err(JoinMismatch::Physical);
        }
        if !self.attrs.is_same(&next.attrs) {
            return Err(JoinMismatch::Attributes);
        }
        if self.children.is_some() != next.children.is_some() {
            return Err(JoinMismatch::Nested);
        }
        Ok(())
    }

    /// Append `next`, which must directly follow and match this mapping.
    ///
    /// # Errors
    /// See [`can_join`](Self::can_join); `self` is unchanged on error.
    pub fn join(&mut self, next: &Self) -> Result<(), JoinMismatch> {
        self.can_join(next)?;
        if let (Some(mine), Some(theirs)) =
            (self.children.as_deref_mut(), next.children.as_deref())
        {
            mine.append(theirs);
        }
        self.range.size += next.size();
        Ok(())
    }

    /// Move this mapping to page size `new`, keeping backing and attributes.
    ///
    /// # Errors
    /// - [`PmError::Unsupported`] for SMMU and ATS mappings.
    /// - [`PmError::PageSizeTransition`] for transitions needing two steps.
    /// - [`PmError::InvalidArgument`] if the mapping or its backing is not
    ///   aligned to both page sizes.
    pub fn change_page_size(
        &mut self,
        ctx: &mut MapCtx<'_, '_>,
        new: PageSize,
    ) -> Result<(), PmError> {
        let flags = self.attrs.to_flags()?;
        let backing = self.backing;
        self.retarget(ctx, new, backing, flags)
    }

    /// Point this mapping at `target` with page size `page_size`, merging
    /// flags: bits in `keep` come from the current attributes, the rest from
    /// `donor_flags`. A valid entry is invalidated first when the page size
    /// changes.
    ///
    /// # Errors
    /// As [`change_page_size`](Self::change_page_size); ATS mappings have no
    /// entries to rewrite.
    pub fn modify_ptes(
        &mut self,
        ctx: &mut MapCtx<'_, '_>,
        target: Backing,
        page_size: PageSize,
        donor_flags: MapFlags,
        keep: MapFlags,
    ) -> Result<(), PmError> {
        if self.kind == MappingKind::Ats {
            return Err(PmError::Unsupported("ATS mappings have no page-table entries"));
        }
        let current = self.attrs.to_flags()?;
        let flags = current.merge(donor_flags, keep);
        if self.kind == MappingKind::Smmu {
            if page_size != self.page_size {
                return Err(PmError::Unsupported("SMMU mappings keep their page size"));
            }
            return self.write_smmu(ctx, target, flags);
        }

        if page_size != self.page_size && current.contains(MapFlags::VALID) {
            let leaf = self.leaf_level(ctx, self.page_size)?;
            log::debug!("invalidate {:?} before page size change", self.range);
            let (offset, size) = (self.offset(), self.size());
            ctx.modify(leaf, offset, size, EntryOps::CLEAR_VALID, &EntryArgs::default())?;
        }
        self.retarget(ctx, page_size, target, flags)
    }

    /// Set and clear flags of the active translation.
    ///
    /// # Errors
    /// [`PmError::Unsupported`] for ATS mappings; entry errors.
    pub fn update_flags(
        &mut self,
        ctx: &mut MapCtx<'_, '_>,
        set: MapFlags,
        clear: MapFlags,
    ) -> Result<(), PmError> {
        if set.intersects(clear) {
            return Err(PmError::BadParameter("flag both set and cleared"));
        }
        if self.kind == MappingKind::Ats {
            return Err(PmError::Unsupported("ATS mappings have no page-table entries"));
        }
        let flags = self.attrs.to_flags()?.union(set).difference(clear);
        let backing = self.backing;
        if self.kind == MappingKind::Smmu {
            self.write_smmu(ctx, backing, flags)
        } else {
            self.retarget(ctx, self.page_size, backing, flags)
        }
    }

    fn leaf_level(
        &self,
        ctx: &mut MapCtx<'_, '_>,
        page_size: PageSize,
    ) -> Result<MmuLevelIndex, PmError> {
        ctx.tree()?
            .format()
            .leaf_level(page_size)
            .ok_or(PmError::Unsupported("page size not supported by this generation"))
    }

    fn retarget(
        &mut self,
        ctx: &mut MapCtx<'_, '_>,
        new: PageSize,
        backing: Backing,
        flags: MapFlags,
    ) -> Result<(), PmError> {
        match self.kind {
            MappingKind::Gmmu => {}
            MappingKind::Smmu => {
                return Err(PmError::Unsupported("SMMU mappings keep their page size"));
            }
            MappingKind::Ats => {
                return Err(PmError::Unsupported("ATS mappings have no page-table entries"));
            }
        }
        let old = self.page_size;
        check_transition(old, new)?;
        let align = old.bytes().max(new.bytes());
        let va = ctx.virt_base.as_u64() + self.offset();
        if !is_aligned(va, align) || !is_aligned(self.size(), align) {
            return Err(PmError::InvalidArgument("mapping not aligned to both page sizes"));
        }
        if !backing.phys.is_aligned_to(new.bytes()) {
            return Err(PmError::InvalidArgument("backing not aligned to the new page size"));
        }

        let version = ctx.tree()?.format().version;
        let old_leaf = self.leaf_level(ctx, old)?;
        let new_leaf = self.leaf_level(ctx, new)?;
        let (offset, size) = (self.offset(), self.size());
        let write = flags
            .intersection(MapFlags::supported(version))
            .entry_ops(version)
            | EntryOps::SET_PHYS;
        let phys = Some((backing.aperture, backing.phys));

        if old != new {
            log::info!("{:?}: page size {old} -> {new}", self.range);
        }
        match (old, new) {
            _ if old == new => {
                let args = EntryArgs { phys, ..EntryArgs::default() };
                ctx.modify(new_leaf, offset, size, write, &args)?;
            }
            (PageSize::Size2M, _) => {
                let lower = ctx.tree()?.lower_tables(new_leaf);
                let args = EntryArgs {
                    role: EntryRole::Pde,
                    half: PdeHalf::for_lower(new_leaf),
                    lower: &lower,
                    ..EntryArgs::default()
                };
                let connect = EntryOps::RETYPE | EntryOps::CONNECT_LOWER;
                ctx.modify(MmuLevelIndex::Pde0, offset, size, connect, &args)?;
                let args = EntryArgs { phys, ..EntryArgs::default() };
                ctx.modify(new_leaf, offset, size, write, &args)?;
            }
            (_, PageSize::Size2M) => {
                ctx.modify(old_leaf, offset, size, EntryOps::CLEAR_VALID, &EntryArgs::default())?;
                let args = EntryArgs {
                    role: EntryRole::Pte,
                    phys,
                    ..EntryArgs::default()
                };
                ctx.modify(MmuLevelIndex::Pde0, offset, size, EntryOps::RETYPE | write, &args)?;
            }
            _ => {
                ctx.modify(old_leaf, offset, size, EntryOps::CLEAR_VALID, &EntryArgs::default())?;
                let lower = ctx.tree()?.lower_tables(new_leaf);
                let args = EntryArgs {
                    half: PdeHalf::for_lower(new_leaf),
                    lower: &lower,
                    ..EntryArgs::default()
                };
                let ops = if ctx.dual_page_size {
                    EntryOps::CONNECT_LOWER
                } else {
                    EntryOps::CLEAR_VALID | EntryOps::CONNECT_LOWER
                };
                ctx.modify(MmuLevelIndex::Pde0, offset, size, ops, &args)?;
                let args = EntryArgs { phys, ..EntryArgs::default() };
                ctx.modify(new_leaf, offset, size, write, &args)?;
            }
        }

        let driver = ctx.driver;
        let attrs = GmmuAttrs::read(ctx.tree()?, driver, offset, new)?;
        self.page_size = new;
        self.backing = backing;
        self.attrs = MemAttrs::Gmmu(attrs);
        Ok(())
    }

    fn write_smmu(
        &mut self,
        ctx: &mut MapCtx<'_, '_>,
        backing: Backing,
        flags: MapFlags,
    ) -> Result<(), PmError> {
        let mut attrs = self.attrs;
        attrs.set_flags(flags)?;
        let MemAttrs::Smmu(SmmuAttrs { valid, flags: raw }) = attrs else {
            return Err(PmError::SoftwareError("SMMU mapping without SMMU attributes"));
        };

        let step = self.page_size.bytes();
        let mut delta = 0;
        while delta < self.size() {
            let pte = PteInfo {
                valid,
                aperture: backing.aperture,
                address: backing.phys + delta,
                flags: raw,
            };
            ctx.driver.set_pte_info(&SetPteInfoParams {
                vaspace: ctx.vaspace,
                va: ctx.virt_base + self.offset() + delta,
                page_size: self.page_size,
                pte,
            })?;
            delta += step;
        }
        ctx.invalidate_after_driver_writes()?;
        self.backing = backing;
        self.attrs = attrs;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SurfaceId;
    use crate::attrs::AtsAttrs;

    fn mapping(offset: u64, size: u64, phys: u64) -> PmMemMapping {
        PmMemMapping::new(
            PmMemRange::new(SurfaceId::new(0, 0), offset, size),
            PageSize::Size64K,
            Backing {
                mem_handle: MemHandle(7),
                mem_offset: offset,
                aperture: Aperture::Video,
                phys: PhysicalAddress::new(phys),
            },
            MappingKind::Gmmu,
            MemAttrs::Gmmu(GmmuAttrs::new(gmmu_format::MmuVersion::V2, PageSize::Size64K)),
        )
    }

    #[test]
    fn split_then_join_reconstructs() {
        let original = mapping(0, 0x4_0000, 0x100_0000);
        let mut lower = original.clone();
        let upper = lower.split(0x1_0000).unwrap();
        assert_eq!(lower.size(), 0x1_0000);
        assert_eq!(upper.offset(), 0x1_0000);
        assert_eq!(upper.backing().phys, PhysicalAddress::new(0x101_0000));
        assert_eq!(upper.backing().mem_offset, 0x1_0000);

        lower.join(&upper).unwrap();
        assert!(lower.is_same(&original));
    }

    #[test]
    fn split_must_hit_a_page_boundary() {
        let mut m = mapping(0, 0x4_0000, 0);
        assert!(matches!(m.split(0x1000), Err(PmError::InvalidArgument(_))));
        assert!(matches!(m.split(0), Err(PmError::InvalidArgument(_))));
        assert!(matches!(m.split(0x4_0000), Err(PmError::InvalidArgument(_))));
        assert_eq!(m.size(), 0x4_0000);
    }

    #[test]
    fn join_refuses_mismatches() {
        let a = mapping(0, 0x1_0000, 0x100_0000);
        let gap = mapping(0x2_0000, 0x1_0000, 0x101_0000);
        assert_eq!(a.can_join(&gap), Err(JoinMismatch::NotAdjacent));

        let mut b = mapping(0x1_0000, 0x1_0000, 0x200_0000);
        assert_eq!(a.can_join(&b), Err(JoinMismatch::Physical));

        b = mapping(0x1_0000, 0x1_0000, 0x101_0000);
        b.backing.mem_handle = MemHandle(8);
        assert_eq!(a.can_join(&b), Err(JoinMismatch::Handle));

        b = mapping(0x1_0000, 0x1_0000, 0x101_0000);
        b.attrs = MemAttrs::Ats(AtsAttrs { aperture: Aperture::Video });
        assert_eq!(a.can_join(&b), Err(JoinMismatch::Attributes));

        b = mapping(0x1_0000, 0x1_0000, 0x101_0000);
        assert_eq!(a.can_join(&b), Ok(()));
    }

    #[test]
    fn transitions() {
        use PageSize::{Size2M, Size4K, Size64K, Size512M};
        let direct = [
            (Size2M, Size4K),
            (Size2M, Size64K),
            (Size4K, Size2M),
            (Size64K, Size2M),
            (Size4K, Size64K),
            (Size64K, Size4K),
        ];
        for (from, to) in direct {
            assert!(check_transition(from, to).is_ok(), "{from} -> {to}");
        }
        assert_eq!(
            check_transition(Size2M, Size512M),
            Err(PmError::PageSizeTransition { from: Size2M, to: Size512M })
        );
        assert!(check_transition(Size512M, Size4K).is_err());
    }
}
