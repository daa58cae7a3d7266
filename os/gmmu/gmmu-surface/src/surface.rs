//! # Surfaces
//!
//! A [`PmSurface`] wraps one caller buffer, its current mappings and a
//! snapshot of the mappings found when it was first explored. Surfaces live
//! in a [`SurfaceTable`] and are named by generational [`SurfaceId`]s, so a
//! stale id is detected instead of dangling.
//!
//! ## Reference counting
//!
//! Two counters are kept: `refs` counts every holder, `child_refs` the holders
//! that live inside the surface's own mapping lists. Children alone never
//! keep a surface alive: it is destroyed by the [`release`](SurfaceRefCount::release)
//! that makes both counts equal.

use alloc::boxed::Box;
use alloc::vec::Vec;
use gmmu_addresses::{Aperture, MemHandle, PhysicalAddress};
use gmmu_tree::{GmmuDriver, MmuLevelTreeRegistry, TreeKey, VaSpaceKind};

use crate::device::Buffer;
use crate::helper::PmMemMappingsHelper;
use crate::mapping::{Backing, MapCtx, MappingKind, PmMemMapping};
use crate::{MapFlags, PmError, PmMemRange};

/// Generational index into a [`SurfaceTable`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SurfaceId {
    index: u32,
    generation: u32,
}

impl SurfaceId {
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

/// Two-tier reference count.
///
/// `refs >= child_refs` always holds; violating it is a caller bug and
/// panics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SurfaceRefCount {
    refs: u32,
    child_refs: u32,
    destroying: bool,
}

impl SurfaceRefCount {
    /// One reference, held by the creator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            refs: 1,
            child_refs: 0,
            destroying: false,
        }
    }

    #[must_use]
    pub const fn refs(&self) -> u32 {
        self.refs
    }

    #[must_use]
    pub const fn child_refs(&self) -> u32 {
        self.child_refs
    }

    #[must_use]
    pub const fn is_destroying(&self) -> bool {
        self.destroying
    }

    /// # Panics
    /// While the surface is being destroyed.
    pub fn add_ref(&mut self) {
        assert!(!self.destroying, "reference taken on a surface being destroyed");
        self.refs += 1;
    }

    /// Mark one existing reference as held from inside the surface.
    ///
    /// # Panics
    /// If every reference is already a child reference.
    pub fn add_child_ref(&mut self) {
        assert!(self.child_refs < self.refs, "child reference without a reference");
        self.child_refs += 1;
    }

    /// # Panics
    /// Without child references.
    pub fn release_child(&mut self) {
        assert!(self.child_refs > 0, "child reference released twice");
        self.child_refs -= 1;
    }

    /// Drop one reference; `true` if the surface must now be destroyed.
    /// Calls made while destroying are ignored.
    ///
    /// # Panics
    /// If only child references remain.
    pub fn release(&mut self) -> bool {
        if self.destroying {
            return false;
        }
        assert!(self.refs > self.child_refs, "released a reference held only by children");
        self.refs -= 1;
        if self.refs == self.child_refs {
            self.destroying = true;
            return true;
        }
        false
    }
}

/// Physical memory a surface stopped using but keeps until the test ends.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Abandoned {
    pub range: PmMemRange,
    pub backing: Backing,
}

/// One buffer under test.
pub struct PmSurface {
    id: SurfaceId,
    buffer: Box<dyn Buffer>,
    rc: SurfaceRefCount,
    kind: Option<MappingKind>,
    current: Option<PmMemMappingsHelper>,
    original: Option<PmMemMappingsHelper>,
    kept_alive: Vec<Abandoned>,
    internal: bool,
}

impl PmSurface {
    #[must_use]
    pub fn new(id: SurfaceId, buffer: Box<dyn Buffer>) -> Self {
        Self {
            id,
            buffer,
            rc: SurfaceRefCount::new(),
            kind: None,
            current: None,
            original: None,
            kept_alive: Vec::new(),
            internal: false,
        }
    }

    /// A surface allocated for the crate's own use, such as move donors.
    pub(crate) fn new_internal(id: SurfaceId, buffer: Box<dyn Buffer>) -> Self {
        Self {
            internal: true,
            ..Self::new(id, buffer)
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> SurfaceId {
        self.id
    }

    #[must_use]
    pub fn buffer(&self) -> &dyn Buffer {
        self.buffer.as_ref()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    /// The whole surface as a range.
    #[must_use]
    pub fn range(&self) -> PmMemRange {
        PmMemRange::new(self.id, 0, self.buffer.size())
    }

    #[must_use]
    pub const fn ref_count(&self) -> &SurfaceRefCount {
        &self.rc
    }

    pub const fn ref_count_mut(&mut self) -> &mut SurfaceRefCount {
        &mut self.rc
    }

    #[must_use]
    pub const fn is_internal(&self) -> bool {
        self.internal
    }

    /// Mapping kind, known once explored.
    #[must_use]
    pub const fn kind(&self) -> Option<MappingKind> {
        self.kind
    }

    /// Key of this surface's page-table tree.
    #[must_use]
    pub fn tree_key(&self, driver: &dyn GmmuDriver) -> TreeKey {
        TreeKey {
            device: driver.device_id(),
            mem: self.buffer.mem_handle(),
            virt_base: self.buffer.virt_base(),
            vaspace: self.buffer.vaspace(),
        }
    }

    #[must_use]
    pub const fn current(&self) -> Option<&PmMemMappingsHelper> {
        self.current.as_ref()
    }

    #[must_use]
    pub const fn original(&self) -> Option<&PmMemMappingsHelper> {
        self.original.as_ref()
    }

    pub const fn current_mut(&mut self) -> Option<&mut PmMemMappingsHelper> {
        self.current.as_mut()
    }

    #[must_use]
    pub fn kept_alive(&self) -> &[Abandoned] {
        &self.kept_alive
    }

    pub(crate) fn keep_alive(&mut self, abandoned: Abandoned) {
        log::debug!("{:?} keeps {:?} alive", self.id, abandoned.backing);
        self.kept_alive.push(abandoned);
    }

    pub(crate) fn clear_kept_alive(&mut self) {
        self.kept_alive.clear();
    }

    /// Drop all mappings; the next use explores again.
    pub(crate) fn forget_mappings(&mut self) {
        self.kind = None;
        self.current = None;
        self.original = None;
        self.kept_alive.clear();
    }

    /// Original backing of byte `offset`, ignoring remaps.
    #[must_use]
    pub fn original_phys(&self, offset: u64) -> (Aperture, PhysicalAddress) {
        (self.buffer.location().aperture(), self.buffer.phys_addr(offset))
    }

    #[must_use]
    pub fn mem_handle(&self) -> MemHandle {
        self.buffer.mem_handle()
    }

    /// Explore the surface on first use and snapshot the result.
    ///
    /// # Errors
    /// - [`PmError::NotAllocated`] before the buffer has memory.
    /// - Exploration errors.
    pub fn ensure_mappings(
        &mut self,
        driver: &dyn GmmuDriver,
        trees: &mut MmuLevelTreeRegistry,
        prefer_legacy: bool,
    ) -> Result<&mut PmMemMappingsHelper, PmError> {
        if self.current.is_none() {
            self.explore(driver, trees, prefer_legacy)?;
        }
        self.current
            .as_mut()
            .ok_or(PmError::SoftwareError("surface explored without mappings"))
    }

    fn explore(
        &mut self,
        driver: &dyn GmmuDriver,
        trees: &mut MmuLevelTreeRegistry,
        prefer_legacy: bool,
    ) -> Result<(), PmError> {
        if !self.buffer.is_allocated() {
            return Err(PmError::NotAllocated);
        }
        let range = self.range();
        let buffer = self.buffer.as_ref();
        let key = self.tree_key(driver);
        let kind = if buffer.is_ats() {
            MappingKind::Ats
        } else {
            match driver.vaspace_kind(buffer.vaspace())? {
                VaSpaceKind::Gmmu => MappingKind::Gmmu,
                VaSpaceKind::Smmu => MappingKind::Smmu,
            }
        };

        let helper = match kind {
            MappingKind::Gmmu => {
                let tree = trees.get_or_explore(
                    driver,
                    key,
                    buffer.size(),
                    buffer.page_size(),
                    prefer_legacy,
                )?;
                PmMemMappingsHelper::explore_gmmu(range, tree, driver, buffer)?
            }
            MappingKind::Smmu => PmMemMappingsHelper::explore_smmu(range, driver, buffer)?,
            MappingKind::Ats => {
                let nested = trees
                    .get_or_explore(driver, key, buffer.size(), buffer.page_size(), prefer_legacy)
                    .map_err(PmError::from)
                    .and_then(|tree| {
                        PmMemMappingsHelper::explore_gmmu(range, tree, driver, buffer)
                    });
                let nested = match nested {
                    Ok(nested) => Some(nested),
                    Err(e) => {
                        log::debug!("ATS surface {:?} has no GMMU translation: {e}", self.id);
                        trees.invalidate(&key);
                        None
                    }
                };
                PmMemMappingsHelper::explore_ats(range, buffer, nested)?
            }
        };

        log::info!("{:?}: explored {} {kind:?} mappings", self.id, helper.count());
        self.kind = Some(kind);
        self.original = Some(helper.clone());
        self.current = Some(helper);
        self.sync_child_refs();
        Ok(())
    }

    /// Match the child references to the mappings held. Returns `true` if
    /// the surface must be destroyed.
    pub(crate) fn sync_child_refs(&mut self) -> bool {
        if self.rc.is_destroying() {
            return false;
        }
        let held = self.current.as_ref().map_or(0, PmMemMappingsHelper::count)
            + self.original.as_ref().map_or(0, PmMemMappingsHelper::count);
        let held = u32::try_from(held).unwrap_or(u32::MAX);
        let mut destroy = false;
        while self.rc.child_refs() < held {
            self.rc.add_ref();
            self.rc.add_child_ref();
        }
        while self.rc.child_refs() > held {
            self.rc.release_child();
            destroy |= self.rc.release();
        }
        destroy
    }

    /// Whether the current mappings differ from the explored ones.
    #[must_use]
    pub fn diverged(&self) -> bool {
        match (&self.current, &self.original) {
            (Some(current), Some(original)) => !current.is_same(original),
            _ => false,
        }
    }

    /// Point every mapping back at its original backing, page size and
    /// flags.
    ///
    /// With dual page sizes the sibling leaf stays connected, so its entries
    /// are invalidated first; a stale valid small page would otherwise win
    /// over the restored big page.
    ///
    /// # Errors
    /// - Mapping errors; the surface is left partly restored.
    /// - [`PmError::SoftwareError`] if the rewritten mappings still differ
    ///   from the original ones. The surface stays diverged.
    pub fn restore(&mut self, ctx: &mut MapCtx<'_, '_>) -> Result<(), PmError> {
        let (Some(current), Some(original)) = (self.current.as_mut(), self.original.as_ref()) else {
            return Ok(());
        };
        if current.is_same(original) {
            return Ok(());
        }
        log::info!("{:?}: restoring original mappings", self.id);

        for target in original.mappings() {
            if target.kind() == MappingKind::Ats {
                continue;
            }
            let indices = current.split_mem_mappings(target.range())?;
            let pieces = &mut current.mappings_mut()[indices.clone()];
            if pieces.len() == 1 && pieces[0].is_same(target) {
                continue;
            }

            let smallest = pieces
                .iter()
                .map(PmMemMapping::page_size)
                .min()
                .unwrap_or(target.page_size());
            for piece in pieces.iter_mut() {
                if piece.page_size() != smallest {
                    piece.change_page_size(ctx, smallest)?;
                }
            }
            let first = &pieces[0];
            let mut merged = PmMemMapping::new(
                target.range(),
                smallest,
                first.backing(),
                first.kind(),
                *first.attrs(),
            );
            if ctx.dual_page_size && target.kind() == MappingKind::Gmmu {
                invalidate_sibling_leaf(ctx, target)?;
            }
            let flags = target.attrs().to_flags()?;
            let (backing, page_size) = (target.backing(), target.page_size());
            merged.modify_ptes(ctx, backing, page_size, flags, MapFlags::empty())?;
            current.replace(indices, merged);
        }
        current.join_mem_mappings(current.range());
        self.adopt_original()
    }

    /// Take the snapshot as current once the rewritten mappings match it.
    /// Otherwise the real mappings are kept and the surface stays diverged.
    fn adopt_original(&mut self) -> Result<(), PmError> {
        if let (Some(current), Some(original)) = (&self.current, &self.original)
            && !current.is_same(original)
        {
            log::warn!("{:?}: mappings still differ after restore", self.id);
            return Err(PmError::SoftwareError("mappings differ from the original after restore"));
        }
        self.current.clone_from(&self.original);
        self.kept_alive.clear();
        Ok(())
    }
}

/// Clear the leaf entries of the 4K/64K level that `target` does not use.
fn invalidate_sibling_leaf(ctx: &mut MapCtx<'_, '_>, target: &PmMemMapping) -> Result<(), PmError> {
    use gmmu_addresses::PageSize::{Size4K, Size64K};
    let sibling = match target.page_size() {
        Size4K => Size64K,
        Size64K => Size4K,
        _ => return Ok(()),
    };
    ctx.clear_leaf(sibling, target.offset(), target.size())
}

impl core::fmt::Debug for PmSurface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PmSurface")
            .field("id", &self.id)
            .field("size", &self.buffer.size())
            .field("rc", &self.rc)
            .field("kind", &self.kind)
            .field("internal", &self.internal)
            .finish_non_exhaustive()
    }
}

struct Slot {
    generation: u32,
    surface: Option<PmSurface>,
}

/// Arena of surfaces.
#[derive(Default)]
pub struct SurfaceTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SurfaceTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Store the surface built by `make` under a fresh id.
    pub fn insert_with(&mut self, make: impl FnOnce(SurfaceId) -> PmSurface) -> SurfaceId {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot {
                generation: 0,
                surface: None,
            });
            u32::try_from(self.slots.len() - 1).unwrap_or(u32::MAX)
        });
        let slot = &mut self.slots[index as usize];
        let id = SurfaceId::new(index, slot.generation);
        slot.surface = Some(make(id));
        id
    }

    #[must_use]
    pub fn get(&self, id: SurfaceId) -> Option<&PmSurface> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.surface.as_ref())
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut PmSurface> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.surface.as_mut())
    }

    /// Two distinct surfaces at once.
    ///
    /// # Errors
    /// [`PmError::NoSuchSurface`] for stale ids, [`PmError::InvalidArgument`]
    /// if both ids are equal.
    pub fn get2_mut(
        &mut self,
        a: SurfaceId,
        b: SurfaceId,
    ) -> Result<(&mut PmSurface, &mut PmSurface), PmError> {
        if a.index == b.index {
            return Err(PmError::InvalidArgument("both ids name one surface"));
        }
        self.get(a).ok_or(PmError::NoSuchSurface(a))?;
        self.get(b).ok_or(PmError::NoSuchSurface(b))?;
        let (lo, hi) = if a.index < b.index { (a, b) } else { (b, a) };
        let (head, tail) = self.slots.split_at_mut(hi.index as usize);
        let first = head[lo.index as usize]
            .surface
            .as_mut()
            .ok_or(PmError::NoSuchSurface(lo))?;
        let second = tail[0].surface.as_mut().ok_or(PmError::NoSuchSurface(hi))?;
        Ok(if a.index < b.index { (first, second) } else { (second, first) })
    }

    /// Remove a surface; its id and any copies of it go stale.
    pub fn remove(&mut self, id: SurfaceId) -> Option<PmSurface> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let surface = slot.surface.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(surface)
    }

    /// Ids of all live surfaces.
    pub fn ids(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.surface
                .as_ref()
                .map(|_| SurfaceId::new(u32::try_from(i).unwrap_or(u32::MAX), s.generation))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.surface.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for SurfaceTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().filter_map(|s| s.surface.as_ref()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{GmmuAttrs, MemAttrs};
    use gmmu_addresses::PageSize;
    use gmmu_format::MmuVersion;

    struct Dummy;
    impl Buffer for Dummy {
        fn size(&self) -> u64 {
            0x1000
        }
        fn mem_handle(&self) -> MemHandle {
            MemHandle(1)
        }
        fn phys_offset(&self) -> u64 {
            0
        }
        fn location(&self) -> gmmu_addresses::Location {
            gmmu_addresses::Location::Fb
        }
        fn virt_base(&self) -> gmmu_addresses::GpuVirtualAddress {
            gmmu_addresses::GpuVirtualAddress::zero()
        }
        fn vaspace(&self) -> gmmu_addresses::VaSpaceHandle {
            gmmu_addresses::VaSpaceHandle(1)
        }
        fn page_size(&self) -> gmmu_addresses::PageSize {
            gmmu_addresses::PageSize::Size4K
        }
        fn is_allocated(&self) -> bool {
            true
        }
        fn phys_addr(&self, offset: u64) -> PhysicalAddress {
            PhysicalAddress::new(offset)
        }
    }

    fn helper(id: SurfaceId, phys: u64) -> PmMemMappingsHelper {
        let range = PmMemRange::new(id, 0, 0x1000);
        let mut helper = PmMemMappingsHelper::new(range);
        let backing = Backing {
            mem_handle: MemHandle(1),
            mem_offset: 0,
            aperture: Aperture::Video,
            phys: PhysicalAddress::new(phys),
        };
        let attrs = MemAttrs::Gmmu(GmmuAttrs::new(MmuVersion::V2, PageSize::Size4K));
        helper
            .push(PmMemMapping::new(range, PageSize::Size4K, backing, MappingKind::Gmmu, attrs))
            .unwrap();
        helper
    }

    #[test]
    fn destroyed_when_only_children_remain() {
        let mut rc = SurfaceRefCount::new();
        rc.add_ref();
        rc.add_child_ref();
        rc.add_ref();
        rc.add_child_ref();
        assert_eq!((rc.refs(), rc.child_refs()), (3, 2));

        rc.add_ref();
        assert!(!rc.release());
        assert!(rc.release());
        assert!(rc.is_destroying());
        assert!(rc.refs() >= rc.child_refs());

        // Children letting go during destruction do not destroy again.
        rc.release_child();
        assert!(!rc.release());
    }

    #[test]
    #[should_panic(expected = "child reference without a reference")]
    fn children_never_outnumber_refs() {
        let mut rc = SurfaceRefCount::new();
        rc.add_child_ref();
        rc.add_child_ref();
    }

    #[test]
    #[should_panic(expected = "held only by children")]
    fn releasing_a_child_held_ref_panics() {
        let mut rc = SurfaceRefCount::new();
        rc.add_ref();
        rc.add_child_ref();
        rc.add_child_ref();
        rc.release();
    }

    #[test]
    fn stale_ids_are_rejected() {
        let mut table = SurfaceTable::new();
        let a = table.insert_with(|id| PmSurface::new(id, Box::new(Dummy)));
        let b = table.insert_with(|id| PmSurface::new(id, Box::new(Dummy)));
        assert_eq!(table.len(), 2);
        assert!(table.get2_mut(a, b).is_ok());
        assert!(table.get2_mut(a, a).is_err());

        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());

        let c = table.insert_with(|id| PmSurface::new(id, Box::new(Dummy)));
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert!(table.get(a).is_none());
        assert_eq!(table.get(c).map(PmSurface::id), Some(c));
        assert_eq!(table.ids().count(), 2);
    }

    #[test]
    fn unconverged_restores_keep_the_real_mappings() {
        let id = SurfaceId::new(0, 0);
        let mut surface = PmSurface::new(id, Box::new(Dummy));
        surface.original = Some(helper(id, 0x10_0000));
        surface.current = Some(helper(id, 0x20_0000));
        assert!(surface.diverged());

        assert!(matches!(surface.adopt_original(), Err(PmError::SoftwareError(_))));
        assert!(surface.diverged());
        assert_eq!(
            surface.current.as_ref().unwrap().mappings()[0].backing().phys,
            PhysicalAddress::new(0x20_0000)
        );

        surface.current = Some(helper(id, 0x10_0000));
        surface.adopt_original().unwrap();
        assert!(!surface.diverged());
    }
}
