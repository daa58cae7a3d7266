//! # Test context
//!
//! [`PmContext`] owns everything one test run needs: the device, the tree
//! registry, the surfaces and the configuration. All surface operations go
//! through it, so no state is shared between runs.
//!
//! Operations that write page tables take a [`WriteMode`]. Out of band the
//! entries are written directly and the TLB is invalidated right away unless
//! [`PmConfig::defer_tlb_invalidate`] is set. In band the writes are queued on
//! the caller's channel and invalidation is left to the caller
//! ([`invalidate_tlb`](PmContext::invalidate_tlb)) once the channel drained.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use gmmu_addresses::{Aperture, PageSize, PhysicalAddress, VaSpaceHandle, align_down, align_up};
use gmmu_tree::channel::PhysTarget;
use gmmu_tree::driver::{InvalidateTlbParams, PteInfoParams};
use gmmu_tree::{CopyEngine, MmuLevelTreeRegistry, WriteMode};
use utils_accessors_derive::Setters;

use crate::device::{Buffer, BufferDesc, PmDevice};
use crate::helper::PmMemMappingsHelper;
use crate::mapping::{Backing, MapCtx, MappingKind, PmMemMapping};
use crate::surface::{Abandoned, PmSurface, SurfaceTable};
use crate::{MapFlags, PmError, PmMemRange, SurfaceId};

/// Pattern written over abandoned memory by [`DisposalPolicy::Scramble`].
pub const SCRAMBLE_PATTERN: u32 = 0x0bad_beef;

/// Bytes captured per mapping by [`DisposalPolicy::Dump`].
pub const DUMP_LIMIT: usize = 0x1000;

/// Granule of CPU copies.
const CPU_CHUNK: usize = 0x1000;

/// What happens to physical memory a move abandons.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum DisposalPolicy {
    /// Capture the first [`DUMP_LIMIT`] bytes.
    Dump,
    /// Sum the contents as little-endian 32-bit words.
    Checksum,
    /// Overwrite with [`SCRAMBLE_PATTERN`] to catch stale accesses.
    /// Out of band only.
    Scramble,
    /// Leave it untouched and record it until the test ends.
    #[default]
    KeepAlive,
}

/// Run configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Setters)]
pub struct PmConfig {
    /// Restore diverged surfaces when they are destroyed.
    pub restore_on_teardown: bool,
    /// Keep both PDE0 pointers connected when switching 4K and 64K.
    pub dual_page_size: bool,
    /// Batch TLB invalidation instead of invalidating after each write.
    pub defer_tlb_invalidate: bool,
    pub default_disposal: DisposalPolicy,
    /// Explore through the legacy per-PDE query first.
    pub prefer_legacy_query: bool,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            restore_on_teardown: true,
            dual_page_size: false,
            defer_tlb_invalidate: false,
            default_disposal: DisposalPolicy::KeepAlive,
            prefer_legacy_query: false,
        }
    }
}

/// Parameters of [`PmContext::move_phys_mem`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Setters)]
pub struct MoveOptions {
    /// Memory to move into; a donor surface is allocated when `None`.
    pub donor: Option<PmMemRange>,
    pub disposal: DisposalPolicy,
    /// Flags kept from the moved mappings; the rest come from the donor.
    pub keep: MapFlags,
}

impl MoveOptions {
    #[must_use]
    pub const fn new(disposal: DisposalPolicy) -> Self {
        Self {
            donor: None,
            disposal,
            keep: MapFlags::all(),
        }
    }
}

/// Outcome of [`PmContext::move_phys_mem`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MoveReport {
    /// Donor surfaces allocated for the move.
    pub donors: Vec<SurfaceId>,
    pub checksums: Vec<(PmMemRange, u32)>,
    pub dumps: Vec<(PmMemRange, Vec<u8>)>,
}

/// Outcome of [`PmContext::end_test`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EndTestReport {
    pub restored: Vec<SurfaceId>,
    pub invalidated: Vec<VaSpaceHandle>,
    /// Internal surfaces released.
    pub released: usize,
}

/// A run of physical memory that part of a range should point at.
#[derive(Copy, Clone, Debug)]
struct SourceChunk {
    /// Offset from the start of the range being remapped.
    rel: u64,
    len: u64,
    backing: Backing,
    page_size: PageSize,
    flags: MapFlags,
}

/// Everything one test run edits.
pub struct PmContext<D: PmDevice> {
    device: D,
    trees: MmuLevelTreeRegistry,
    surfaces: SurfaceTable,
    config: PmConfig,
    donors: Vec<SurfaceId>,
}

impl<D: PmDevice> PmContext<D> {
    #[must_use]
    pub fn new(device: D, config: PmConfig) -> Self {
        Self {
            device,
            trees: MmuLevelTreeRegistry::new(),
            surfaces: SurfaceTable::new(),
            config,
            donors: Vec::new(),
        }
    }

    #[must_use]
    pub const fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub const fn config(&self) -> &PmConfig {
        &self.config
    }

    pub const fn config_mut(&mut self) -> &mut PmConfig {
        &mut self.config
    }

    #[must_use]
    pub const fn trees(&self) -> &MmuLevelTreeRegistry {
        &self.trees
    }

    #[must_use]
    pub const fn surfaces(&self) -> &SurfaceTable {
        &self.surfaces
    }

    /// Out-of-band mode following the configuration.
    #[must_use]
    pub fn write_mode(&self) -> WriteMode<'static> {
        if self.config.defer_tlb_invalidate {
            WriteMode::deferred()
        } else {
            WriteMode::direct()
        }
    }

    /// Track `buffer`; the caller holds the first reference.
    pub fn add_surface(&mut self, buffer: Box<dyn Buffer>) -> SurfaceId {
        let id = self.surfaces.insert_with(|id| PmSurface::new(id, buffer));
        log::info!("added surface {id:?}");
        id
    }

    /// # Errors
    /// [`PmError::NoSuchSurface`] for stale ids.
    pub fn surface(&self, id: SurfaceId) -> Result<&PmSurface, PmError> {
        self.surfaces.get(id).ok_or(PmError::NoSuchSurface(id))
    }

    fn surface_mut(&mut self, id: SurfaceId) -> Result<&mut PmSurface, PmError> {
        self.surfaces.get_mut(id).ok_or(PmError::NoSuchSurface(id))
    }

    /// # Errors
    /// [`PmError::NoSuchSurface`] for stale ids.
    pub fn add_ref(&mut self, id: SurfaceId) -> Result<(), PmError> {
        self.surface_mut(id)?.ref_count_mut().add_ref();
        Ok(())
    }

    /// Drop a reference; returns whether the surface was destroyed.
    ///
    /// # Errors
    /// [`PmError::NoSuchSurface`] for stale ids; restore errors on teardown.
    pub fn release(&mut self, id: SurfaceId) -> Result<bool, PmError> {
        let destroy = self.surface_mut(id)?.ref_count_mut().release();
        if destroy {
            self.destroy(id)?;
        }
        Ok(destroy)
    }

    fn destroy(&mut self, id: SurfaceId) -> Result<(), PmError> {
        let surface = self.surface(id)?;
        let vaspace = surface.buffer().vaspace();
        let mut restored = Ok(());
        if self.config.restore_on_teardown && surface.diverged() {
            let mut mode = WriteMode::deferred();
            restored = self.edit(id, &mut mode, |surface, ctx| surface.restore(ctx));
            if restored.is_ok() && mode.invalidate_pending {
                restored = self.invalidate_tlb(vaspace);
            }
        }
        // The surface goes even if restoring failed.
        if let Some(surface) = self.surfaces.remove(id) {
            let key = surface.tree_key(&self.device);
            self.trees.invalidate(&key);
            log::info!("destroyed surface {id:?}");
        }
        restored
    }

    /// The caller freed the surface's memory: forget its trees and mappings.
    /// Returns how many trees were dropped.
    ///
    /// # Errors
    /// [`PmError::NoSuchSurface`] for stale ids.
    pub fn free_backing(&mut self, id: SurfaceId) -> Result<usize, PmError> {
        let device = self.device.device_id();
        let surface = self.surface_mut(id)?;
        let mem = surface.mem_handle();
        surface.forget_mappings();
        let destroy = surface.sync_child_refs();
        let dropped = self.trees.invalidate_mem(device, mem);
        if destroy {
            self.destroy(id)?;
        }
        Ok(dropped)
    }

    /// Invalidate the TLB of one address space, for callers of in-band or
    /// deferred writes.
    ///
    /// # Errors
    /// Driver errors.
    pub fn invalidate_tlb(&self, vaspace: VaSpaceHandle) -> Result<(), PmError> {
        self.device.invalidate_tlb(&InvalidateTlbParams { vaspace })?;
        Ok(())
    }

    fn ensure(&mut self, id: SurfaceId) -> Result<&mut PmMemMappingsHelper, PmError> {
        let surface = self.surfaces.get_mut(id).ok_or(PmError::NoSuchSurface(id))?;
        surface.ensure_mappings(&self.device, &mut self.trees, self.config.prefer_legacy_query)
    }

    /// Current mappings of a surface, exploring it on first use.
    ///
    /// # Errors
    /// [`PmError::NoSuchSurface`] for stale ids; exploration errors.
    pub fn mappings(&mut self, id: SurfaceId) -> Result<&PmMemMappingsHelper, PmError> {
        self.ensure(id).map(|h| &*h)
    }

    /// Mappings found when the surface was first explored.
    ///
    /// # Errors
    /// As [`mappings`](Self::mappings).
    pub fn original_mappings(&mut self, id: SurfaceId) -> Result<&PmMemMappingsHelper, PmError> {
        self.ensure(id)?;
        self.surface(id)?
            .original()
            .ok_or(PmError::SoftwareError("explored surface without a snapshot"))
    }

    /// Split the current mappings at the bounds of `range`; returns the
    /// indices of the mappings inside it.
    ///
    /// # Errors
    /// See [`PmMemMappingsHelper::split_mem_mappings`].
    pub fn split(&mut self, range: PmMemRange) -> Result<Range<usize>, PmError> {
        let indices = self.ensure(range.surface)?.split_mem_mappings(range);
        self.settle(range.surface)?;
        indices
    }

    /// Join matching mappings inside `range`; returns the number of joins.
    ///
    /// # Errors
    /// [`PmError::NoSuchSurface`] for stale ids; exploration errors.
    pub fn join(&mut self, range: PmMemRange) -> Result<usize, PmError> {
        let joined = self.ensure(range.surface)?.join_mem_mappings(range);
        self.settle(range.surface)?;
        Ok(joined)
    }

    /// Resync child references after the mapping count changed.
    fn settle(&mut self, id: SurfaceId) -> Result<(), PmError> {
        if self.surface_mut(id)?.sync_child_refs() {
            self.destroy(id)?;
        }
        Ok(())
    }

    /// Run `f` on an explored surface with a context for rewriting its
    /// translations.
    fn edit<R>(
        &mut self,
        id: SurfaceId,
        mode: &mut WriteMode<'_>,
        f: impl FnOnce(&mut PmSurface, &mut MapCtx<'_, '_>) -> Result<R, PmError>,
    ) -> Result<R, PmError> {
        let Self {
            device,
            trees,
            surfaces,
            config,
            ..
        } = self;
        let surface = surfaces.get_mut(id).ok_or(PmError::NoSuchSurface(id))?;
        surface.ensure_mappings(&*device, trees, config.prefer_legacy_query)?;
        let key = surface.tree_key(&*device);
        let tree = match surface.kind() {
            Some(MappingKind::Smmu) | None => None,
            Some(_) => trees.get_mut(&key),
        };
        let mut ctx = MapCtx {
            driver: &*device,
            tree,
            vaspace: surface.buffer().vaspace(),
            virt_base: surface.buffer().virt_base(),
            mode,
            dual_page_size: config.dual_page_size,
        };
        let result = f(surface, &mut ctx);
        drop(ctx);
        self.settle(id)?;
        result
    }

    /// Move the mappings of `range` to page size `page_size`.
    ///
    /// # Errors
    /// See [`PmMemMapping::change_page_size`].
    pub fn change_page_size(
        &mut self,
        range: PmMemRange,
        page_size: PageSize,
        mode: &mut WriteMode<'_>,
    ) -> Result<(), PmError> {
        self.edit(range.surface, mode, |surface, ctx| {
            let current = current_of(surface)?;
            let indices = current.split_mem_mappings(range)?;
            for mapping in &mut current.mappings_mut()[indices] {
                mapping.change_page_size(ctx, page_size)?;
            }
            current.join_mem_mappings(current.range());
            Ok(())
        })
    }

    /// Set and clear mapping flags over `range`.
    ///
    /// # Errors
    /// See [`PmMemMapping::update_flags`].
    pub fn update_flags(
        &mut self,
        range: PmMemRange,
        set: MapFlags,
        clear: MapFlags,
        mode: &mut WriteMode<'_>,
    ) -> Result<(), PmError> {
        self.edit(range.surface, mode, |surface, ctx| {
            let current = current_of(surface)?;
            let indices = current.split_mem_mappings(range)?;
            for mapping in &mut current.mappings_mut()[indices] {
                if mapping.kind() != MappingKind::Ats {
                    mapping.update_flags(ctx, set, clear)?;
                }
            }
            current.join_mem_mappings(current.range());
            Ok(())
        })
    }

    /// Physical location of surface byte `offset` as currently mapped, plus
    /// the bytes left in its page.
    fn resolve(
        &mut self,
        id: SurfaceId,
        offset: u64,
    ) -> Result<(Aperture, PhysicalAddress, u64), PmError> {
        let Self {
            device,
            trees,
            surfaces,
            config,
            ..
        } = self;
        let surface = surfaces.get_mut(id).ok_or(PmError::NoSuchSurface(id))?;
        if offset >= surface.size() {
            return Err(PmError::InvalidArgument("offset outside surface"));
        }
        surface.ensure_mappings(&*device, trees, config.prefer_legacy_query)?;
        let buffer = surface.buffer();
        let va = buffer.virt_base().as_u64() + offset;
        match surface.kind() {
            Some(MappingKind::Gmmu) => {
                let key = surface.tree_key(&*device);
                let tree = trees
                    .get_mut(&key)
                    .ok_or(PmError::SoftwareError("explored surface without a tree"))?;
                let t = tree.translate(&*device, offset)?;
                if !t.entry.lo.valid {
                    return Err(PmError::InvalidArgument("virtual page is not mapped"));
                }
                let left = align_down(va, t.page_size.bytes()) + t.page_size.bytes() - va;
                Ok((t.aperture, t.address, left))
            }
            Some(MappingKind::Smmu) => {
                let page_size = buffer.page_size();
                let page = align_down(va, page_size.bytes());
                let pte = device.get_pte_info(&PteInfoParams {
                    vaspace: buffer.vaspace(),
                    va: gmmu_addresses::GpuVirtualAddress::new(page),
                    page_size,
                })?;
                if !pte.valid {
                    return Err(PmError::InvalidArgument("virtual page is not mapped"));
                }
                Ok((pte.aperture, pte.address + (va - page), page + page_size.bytes() - va))
            }
            Some(MappingKind::Ats) | None => {
                let (aperture, address) = surface.original_phys(offset);
                let page_size = buffer.page_size().bytes();
                Ok((aperture, address, align_down(offset, page_size) + page_size - offset))
            }
        }
    }

    /// Read through the live translation.
    ///
    /// # Errors
    /// - [`PmError::InvalidArgument`] if `buf` does not match the range or a
    ///   page is unmapped.
    /// - Translation and driver errors.
    pub fn read_virt(&mut self, range: PmMemRange, buf: &mut [u8]) -> Result<(), PmError> {
        check_len(range, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let (aperture, address, left) =
                self.resolve(range.surface, range.offset + done as u64)?;
            let n = clamp(left, buf.len() - done);
            self.device
                .read_phys(0, aperture, address, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Write through the live translation, on every subdevice.
    ///
    /// # Errors
    /// As [`read_virt`](Self::read_virt).
    pub fn write_virt(&mut self, range: PmMemRange, data: &[u8]) -> Result<(), PmError> {
        check_len(range, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let (aperture, address, left) =
                self.resolve(range.surface, range.offset + done as u64)?;
            let n = clamp(left, data.len() - done);
            self.device
                .broadcast_phys(aperture, address, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Read the surface's original backing, ignoring any remap.
    ///
    /// # Errors
    /// As [`read_virt`](Self::read_virt).
    pub fn read_phys_original(&self, range: PmMemRange, buf: &mut [u8]) -> Result<(), PmError> {
        check_len(range, buf.len())?;
        let surface = self.surface(range.surface)?;
        if range.end() > surface.size() {
            return Err(PmError::InvalidArgument("range outside surface"));
        }
        let page_size = surface.buffer().page_size().bytes();
        let mut done = 0;
        while done < buf.len() {
            let offset = range.offset + done as u64;
            let (aperture, address) = surface.original_phys(offset);
            let n = clamp(align_down(offset, page_size) + page_size - offset, buf.len() - done);
            self.device
                .read_phys(0, aperture, address, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Write the surface's original backing on every subdevice.
    ///
    /// # Errors
    /// As [`read_virt`](Self::read_virt).
    pub fn write_phys_original(&self, range: PmMemRange, data: &[u8]) -> Result<(), PmError> {
        check_len(range, data.len())?;
        let surface = self.surface(range.surface)?;
        if range.end() > surface.size() {
            return Err(PmError::InvalidArgument("range outside surface"));
        }
        let page_size = surface.buffer().page_size().bytes();
        let mut done = 0;
        while done < data.len() {
            let offset = range.offset + done as u64;
            let (aperture, address) = surface.original_phys(offset);
            let n = clamp(align_down(offset, page_size) + page_size - offset, data.len() - done);
            self.device
                .broadcast_phys(aperture, address, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Give `range` new physical memory holding the same data.
    ///
    /// The data is copied to the donor (queued on the channel in band,
    /// through the CPU on every subdevice out of band), the mappings are
    /// pointed at the donor and the abandoned memory is disposed of. ATS
    /// mappings have no entries and are left alone.
    ///
    /// # Errors
    /// - [`PmError::SoftwareError`] for [`DisposalPolicy::Scramble`] in band.
    /// - [`PmError::InvalidArgument`] for a donor of different size or one
    ///   overlapping `range`.
    /// - Allocation, copy and mapping errors. A failed move may leave part of
    ///   the range remapped.
    pub fn move_phys_mem(
        &mut self,
        range: PmMemRange,
        options: &MoveOptions,
        mode: &mut WriteMode<'_>,
    ) -> Result<MoveReport, PmError> {
        if options.disposal == DisposalPolicy::Scramble && mode.is_in_band() {
            return Err(PmError::SoftwareError("cannot scramble memory a queued copy still reads"));
        }
        let mut report = MoveReport::default();
        if range.size == 0 {
            return Ok(report);
        }

        let pieces: Vec<PmMemMapping> = {
            let current = self.ensure(range.surface)?;
            let indices = current.split_mem_mappings(range)?;
            current.mappings()[indices]
                .iter()
                .filter(|m| m.kind() != MappingKind::Ats)
                .cloned()
                .collect()
        };
        self.settle(range.surface)?;

        let sources = match options.donor {
            Some(donor) => {
                if donor.size != range.size {
                    return Err(PmError::InvalidArgument("donor differs in size"));
                }
                if donor.overlaps(&range) {
                    return Err(PmError::InvalidArgument("donor overlaps the moved range"));
                }
                self.source_chunks(donor)?
            }
            None => self.allocate_donors(range, &pieces, &mut report)?,
        };

        for piece in &pieces {
            for chunk in &sources {
                let chunk_start = range.offset + chunk.rel;
                let start = piece.offset().max(chunk_start);
                let end = piece.end().min(chunk_start + chunk.len);
                if start >= end {
                    continue;
                }
                let src = piece.backing().advance(start - piece.offset());
                let dst = chunk.backing.advance(start - chunk_start);
                self.copy(src, dst, end - start, mode)?;
            }
        }

        self.remap(range, &sources, options.keep, mode)?;

        for piece in &pieces {
            self.dispose(piece, options.disposal, &mut report)?;
        }
        log::info!(
            "moved {range:?}: {} mappings, {:?} disposal",
            pieces.len(),
            options.disposal
        );
        Ok(report)
    }

    /// Point `dst` at the physical memory `src` currently resolves to.
    ///
    /// Where the source uses smaller pages than the destination, the
    /// destination mappings are moved to the smaller page size first and then
    /// split at the source's boundaries.
    ///
    /// # Errors
    /// - [`PmError::InvalidArgument`] for ranges of different size or
    ///   boundaries that do not line up with pages.
    /// - Mapping errors, leaving part of `dst` remapped.
    pub fn alias_phys_mem(
        &mut self,
        dst: PmMemRange,
        src: PmMemRange,
        mode: &mut WriteMode<'_>,
    ) -> Result<(), PmError> {
        if dst.size != src.size {
            return Err(PmError::InvalidArgument("alias ranges differ in size"));
        }
        let sources = self.source_chunks(src)?;
        self.remap(dst, &sources, MapFlags::all(), mode)?;
        log::info!("aliased {dst:?} to {src:?}");
        Ok(())
    }

    /// Restore every diverged surface, invalidate each touched address space
    /// once and release the crate's internal surfaces.
    ///
    /// A failed restore does not stop the others, and every address space
    /// written to is still invalidated. Donor and kept-alive memory is then
    /// held back, since the failed surfaces may still map it; a later call
    /// retries them.
    ///
    /// # Errors
    /// The first restore or driver error.
    pub fn end_test(&mut self) -> Result<EndTestReport, PmError> {
        let mut report = EndTestReport::default();
        let mut vaspaces = BTreeSet::new();
        let mut mode = WriteMode::deferred();
        let mut failed = None;

        let ids: Vec<SurfaceId> = self.surfaces.ids().collect();
        for id in ids {
            let surface = self.surface(id)?;
            if !surface.diverged() {
                continue;
            }
            vaspaces.insert(surface.buffer().vaspace());
            match self.edit(id, &mut mode, |surface, ctx| surface.restore(ctx)) {
                Ok(()) => report.restored.push(id),
                Err(e) => {
                    log::warn!("{id:?}: restore failed: {e}");
                    failed.get_or_insert(e);
                }
            }
        }
        for vaspace in vaspaces {
            match self.invalidate_tlb(vaspace) {
                Ok(()) => report.invalidated.push(vaspace),
                Err(e) => {
                    failed.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failed {
            return Err(e);
        }

        for id in core::mem::take(&mut self.donors) {
            if self.surfaces.get(id).is_some() {
                self.release(id)?;
                report.released += 1;
            }
        }
        let ids: Vec<SurfaceId> = self.surfaces.ids().collect();
        for id in ids {
            self.surface_mut(id)?.clear_kept_alive();
        }
        log::info!(
            "test ended: {} restored, {} address spaces invalidated",
            report.restored.len(),
            report.invalidated.len()
        );
        Ok(report)
    }

    fn source_chunks(&mut self, src: PmMemRange) -> Result<Vec<SourceChunk>, PmError> {
        let current = self.ensure(src.surface)?;
        if !current.range().contains_range(&src) {
            return Err(PmError::InvalidArgument("source range outside surface"));
        }
        let mut chunks = Vec::new();
        for mapping in current.mappings() {
            let Some(part) = mapping.range().intersection(&src) else {
                continue;
            };
            if mapping.kind() == MappingKind::Ats {
                return Err(PmError::Unsupported("ATS mappings have no page-table flags to copy"));
            }
            chunks.push(SourceChunk {
                rel: part.offset - src.offset,
                len: part.size,
                backing: mapping.backing().advance(part.offset - mapping.offset()),
                page_size: mapping.page_size(),
                flags: mapping.attrs().to_flags()?,
            });
        }
        Ok(chunks)
    }

    /// Allocate donor memory for `pieces`, one donor per page size, each
    /// covering the whole range.
    fn allocate_donors(
        &mut self,
        range: PmMemRange,
        pieces: &[PmMemMapping],
        report: &mut MoveReport,
    ) -> Result<Vec<SourceChunk>, PmError> {
        let (location, vaspace) = {
            let buffer = self.surface(range.surface)?.buffer();
            (buffer.location(), buffer.vaspace())
        };
        let mut donors: Vec<(PageSize, SurfaceId, u64)> = Vec::new();
        let mut chunks = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let page_size = piece.page_size();
            let (id, base) = if let Some(&(_, id, base)) =
                donors.iter().find(|d| d.0 == page_size)
            {
                (id, base)
            } else {
                let base = align_down(range.offset, page_size.bytes());
                let size = align_up(range.end(), page_size.bytes()) - base;
                let buffer = self.device.alloc_buffer(&BufferDesc {
                    size,
                    location,
                    page_size,
                    vaspace,
                })?;
                let id = self.surfaces.insert_with(|id| PmSurface::new_internal(id, buffer));
                log::debug!("donor {id:?}: {size:#x} bytes of {page_size} pages");
                self.donors.push(id);
                report.donors.push(id);
                donors.push((page_size, id, base));
                (id, base)
            };

            let buffer = self.surface(id)?.buffer();
            let offset = piece.offset() - base;
            chunks.push(SourceChunk {
                rel: piece.offset() - range.offset,
                len: piece.size(),
                backing: Backing {
                    mem_handle: buffer.mem_handle(),
                    mem_offset: buffer.phys_offset() + offset,
                    aperture: buffer.location().aperture(),
                    phys: buffer.phys_addr(offset),
                },
                page_size,
                flags: piece.attrs().to_flags()?,
            });
        }
        Ok(chunks)
    }

    /// Point each part of `dst` at its source chunk.
    fn remap(
        &mut self,
        dst: PmMemRange,
        sources: &[SourceChunk],
        keep: MapFlags,
        mode: &mut WriteMode<'_>,
    ) -> Result<(), PmError> {
        self.edit(dst.surface, mode, |surface, ctx| {
            let current = current_of(surface)?;
            current.split_mem_mappings(dst)?;
            for chunk in sources {
                let at = dst.offset + chunk.rel;
                let part = PmMemRange::new(dst.surface, at, chunk.len);
                lower_page_size(current, ctx, part, chunk.page_size)?;
                let indices = current.split_mem_mappings(part)?;
                for mapping in &mut current.mappings_mut()[indices] {
                    if mapping.kind() == MappingKind::Ats {
                        continue;
                    }
                    let target = chunk.backing.advance(mapping.offset() - at);
                    let page_size = mapping.page_size();
                    mapping.modify_ptes(ctx, target, page_size, chunk.flags, keep)?;
                }
            }
            current.join_mem_mappings(current.range());
            Ok(())
        })
    }

    fn copy(
        &self,
        src: Backing,
        dst: Backing,
        len: u64,
        mode: &mut WriteMode<'_>,
    ) -> Result<(), PmError> {
        if let Some(channel) = mode.channel.as_deref_mut() {
            CopyEngine::copy(
                channel,
                PhysTarget::new(src.aperture, src.phys),
                PhysTarget::new(dst.aperture, dst.phys),
                len,
            )?;
            return Ok(());
        }
        let mut buf = vec![0u8; CPU_CHUNK];
        for subdevice in 0..self.device.subdevice_count() {
            let mut done = 0;
            while done < len {
                let n = clamp(len - done, buf.len());
                self.device
                    .read_phys(subdevice, src.aperture, src.phys + done, &mut buf[..n])?;
                self.device
                    .write_phys(subdevice, dst.aperture, dst.phys + done, &buf[..n])?;
                done += n as u64;
            }
        }
        Ok(())
    }

    fn dispose(
        &mut self,
        piece: &PmMemMapping,
        policy: DisposalPolicy,
        report: &mut MoveReport,
    ) -> Result<(), PmError> {
        let old = piece.backing();
        let size = piece.size();
        match policy {
            DisposalPolicy::Dump => {
                if size > DUMP_LIMIT as u64 {
                    log::warn!("dump of {:?} truncated to {DUMP_LIMIT:#x} bytes", piece.range());
                }
                let mut bytes = vec![0u8; clamp(size, DUMP_LIMIT)];
                self.device.read_phys(0, old.aperture, old.phys, &mut bytes)?;
                report.dumps.push((piece.range(), bytes));
            }
            DisposalPolicy::Checksum => {
                let mut buf = vec![0u8; CPU_CHUNK];
                let mut sum = 0u32;
                let mut done = 0;
                while done < size {
                    let n = clamp(size - done, buf.len());
                    self.device
                        .read_phys(0, old.aperture, old.phys + done, &mut buf[..n])?;
                    sum = buf[..n]
                        .chunks(4)
                        .map(|w| {
                            let mut word = [0u8; 4];
                            word[..w.len()].copy_from_slice(w);
                            u32::from_le_bytes(word)
                        })
                        .fold(sum, u32::wrapping_add);
                    done += n as u64;
                }
                report.checksums.push((piece.range(), sum));
            }
            DisposalPolicy::Scramble => {
                let pattern: Vec<u8> = SCRAMBLE_PATTERN
                    .to_le_bytes()
                    .iter()
                    .copied()
                    .cycle()
                    .take(CPU_CHUNK)
                    .collect();
                let mut done = 0;
                while done < size {
                    let n = clamp(size - done, pattern.len());
                    self.device
                        .broadcast_phys(old.aperture, old.phys + done, &pattern[..n])?;
                    done += n as u64;
                }
                log::debug!("scrambled {size:#x} bytes at {:?}", old.phys);
            }
            DisposalPolicy::KeepAlive => {
                self.surface_mut(piece.range().surface)?.keep_alive(Abandoned {
                    range: piece.range(),
                    backing: old,
                });
            }
        }
        Ok(())
    }
}

fn current_of(surface: &mut PmSurface) -> Result<&mut PmMemMappingsHelper, PmError> {
    surface
        .current_mut()
        .ok_or(PmError::SoftwareError("surface edited before exploration"))
}

/// Move the mappings overlapping `part` down to `page_size` where they use
/// larger pages.
fn lower_page_size(
    current: &mut PmMemMappingsHelper,
    ctx: &mut MapCtx<'_, '_>,
    part: PmMemRange,
    page_size: PageSize,
) -> Result<(), PmError> {
    for mapping in current.mappings_mut() {
        if mapping.range().overlaps(&part)
            && mapping.kind() != MappingKind::Ats
            && mapping.page_size() > page_size
        {
            mapping.change_page_size(ctx, page_size)?;
        }
    }
    Ok(())
}

fn check_len(range: PmMemRange, len: usize) -> Result<(), PmError> {
    if u64::try_from(len).ok() == Some(range.size) {
        Ok(())
    } else {
        Err(PmError::InvalidArgument("buffer length differs from range size"))
    }
}

/// `min(a, b)` as a buffer length.
fn clamp(a: u64, b: usize) -> usize {
    usize::try_from(a).map_or(b, |a| a.min(b))
}
