//! # Mapping lists
//!
//! [`PmMemMappingsHelper`] holds the mappings of one surface range, sorted by
//! offset and covering the range without gaps. Exploration builds the list by
//! a run-length scan over the live translation; editing operations split it
//! at their boundaries and join it back afterwards.

use core::ops::Range;

use alloc::vec::Vec;
use gmmu_addresses::{PageSize, align_down};
use gmmu_tree::driver::PteInfoParams;
use gmmu_tree::{GmmuDriver, MmuLevelTree};

use crate::attrs::{AtsAttrs, GmmuAttrs, MemAttrs, SmmuAttrs};
use crate::device::Buffer;
use crate::mapping::{Backing, MappingKind, PmMemMapping};
use crate::{PmError, PmMemRange};

/// Sorted, contiguous mappings of one range.
#[derive(Clone, Debug)]
pub struct PmMemMappingsHelper {
    range: PmMemRange,
    mappings: Vec<PmMemMapping>,
}

impl PmMemMappingsHelper {
    /// An empty list for `range`; fill it with [`push`](Self::push).
    #[must_use]
    pub const fn new(range: PmMemRange) -> Self {
        Self {
            range,
            mappings: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> PmMemRange {
        self.range
    }

    #[must_use]
    pub fn mappings(&self) -> &[PmMemMapping] {
        &self.mappings
    }

    pub fn mappings_mut(&mut self) -> &mut [PmMemMapping] {
        &mut self.mappings
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Mappings stored here, nested ones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.mappings.iter().map(PmMemMapping::count).sum()
    }

    /// Append `mapping`, which must start where the list ends.
    ///
    /// # Errors
    /// [`PmError::InvalidArgument`] if it does not.
    pub fn push(&mut self, mapping: PmMemMapping) -> Result<(), PmError> {
        let expected = self.mappings.last().map_or(self.range.offset, PmMemMapping::end);
        if mapping.offset() != expected || mapping.range().surface != self.range.surface {
            return Err(PmError::InvalidArgument("mapping does not continue the list"));
        }
        if mapping.end() > self.range.end() {
            return Err(PmError::InvalidArgument("mapping exceeds the list's range"));
        }
        self.mappings.push(mapping);
        Ok(())
    }

    /// Index of the mapping containing surface offset `offset`.
    #[must_use]
    pub fn find(&self, offset: u64) -> Option<usize> {
        let i = self.mappings.partition_point(|m| m.end() <= offset);
        self.mappings.get(i).filter(|m| m.range().contains(offset)).map(|_| i)
    }

    /// Index of the first mapping at or after `offset`.
    fn lower_bound(&self, offset: u64) -> usize {
        self.mappings.partition_point(|m| m.offset() < offset)
    }

    /// Make `at` a mapping boundary.
    ///
    /// # Errors
    /// [`PmError::InvalidArgument`] if `at` is outside the list or not on a
    /// page boundary of the mapping it falls into.
    pub fn split_at(&mut self, at: u64) -> Result<(), PmError> {
        if at < self.range.offset || at > self.range.end() {
            return Err(PmError::InvalidArgument("split point outside mappings"));
        }
        let Some(i) = self.find(at) else {
            return Ok(());
        };
        if self.mappings[i].offset() == at {
            return Ok(());
        }
        let upper = self.mappings[i].split(at)?;
        self.mappings.insert(i + 1, upper);
        Ok(())
    }

    /// Split so that mappings exactly bound `range`; returns their indices.
    /// Nested mappings are split at the same points.
    ///
    /// # Errors
    /// [`PmError::InvalidArgument`] if `range` is not inside the list or a
    /// boundary is not on a page boundary.
    pub fn split_mem_mappings(&mut self, range: PmMemRange) -> Result<Range<usize>, PmError> {
        if !self.range.contains_range(&range) {
            return Err(PmError::InvalidArgument("range outside mappings"));
        }
        self.split_at(range.offset)?;
        self.split_at(range.end())?;
        for mapping in &mut self.mappings {
            if let Some(inner) = mapping.range().intersection(&range)
                && let Some(children) = mapping.children_mut()
            {
                children.split_mem_mappings(inner)?;
            }
        }
        debug_assert!(self.check_invariants());
        Ok(self.lower_bound(range.offset)..self.lower_bound(range.end()))
    }

    /// Join adjacent mappings lying inside `range` wherever they match;
    /// returns how many joins happened.
    pub fn join_mem_mappings(&mut self, range: PmMemRange) -> usize {
        let mut joined = 0;
        let mut i = self.lower_bound(range.offset);
        while i + 1 < self.mappings.len() && self.mappings[i + 1].end() <= range.end() {
            let (head, tail) = self.mappings.split_at_mut(i + 1);
            if head[i].join(&tail[0]).is_ok() {
                self.mappings.remove(i + 1);
                joined += 1;
            } else {
                i += 1;
            }
        }
        for mapping in &mut self.mappings {
            if let Some(inner) = mapping.range().intersection(&range)
                && let Some(children) = mapping.children_mut()
            {
                joined += children.join_mem_mappings(inner);
            }
        }
        if joined > 0 {
            log::debug!("joined {joined} mappings in {range:?}");
        }
        debug_assert!(self.check_invariants());
        joined
    }

    /// Detach the mappings from `at` on into a new list. `at` is split first.
    ///
    /// # Errors
    /// See [`split_at`](Self::split_at).
    pub fn split_off(&mut self, at: u64) -> Result<Self, PmError> {
        self.split_at(at)?;
        let i = self.lower_bound(at);
        let upper = Self {
            range: PmMemRange::new(self.range.surface, at, self.range.end() - at),
            mappings: self.mappings.split_off(i),
        };
        self.range.size = at - self.range.offset;
        Ok(upper)
    }

    /// Append a list that starts where this one ends.
    pub fn append(&mut self, other: &Self) {
        debug_assert_eq!(self.range.end(), other.range.offset);
        self.range.size += other.range.size;
        let mut rest = other.mappings.iter().cloned();
        // Mappings meeting at the seam may match again.
        if let (Some(last), Some(first)) = (self.mappings.last_mut(), other.mappings.first())
            && last.join(first).is_ok()
        {
            rest.next();
        }
        self.mappings.extend(rest);
    }

    /// Replace the mappings at `indices` with `with`, which must cover the
    /// same span.
    pub(crate) fn replace(&mut self, indices: Range<usize>, with: PmMemMapping) {
        self.mappings.splice(indices, core::iter::once(with));
        debug_assert!(self.check_invariants());
    }

    /// Sorted, contiguous and covering the list's range, recursively.
    #[must_use]
    pub fn check_invariants(&self) -> bool {
        let mut expected = self.range.offset;
        for mapping in &self.mappings {
            if mapping.offset() != expected
                || mapping.size() == 0
                || mapping.range().surface != self.range.surface
            {
                return false;
            }
            if let Some(children) = mapping.children()
                && (children.range() != mapping.range() || !children.check_invariants())
            {
                return false;
            }
            expected = mapping.end();
        }
        expected == self.range.end()
    }

    /// Mapping-wise equality, ignoring inactive leaf levels.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        self.range == other.range
            && self.mappings.len() == other.mappings.len()
            && self.mappings.iter().zip(&other.mappings).all(|(a, b)| {
                a.is_same(b)
                    && match (a.children(), b.children()) {
                        (Some(x), Some(y)) => x.is_same(y),
                        (None, None) => true,
                        _ => false,
                    }
            })
    }

    /// Discover the GMMU mappings of `range`.
    ///
    /// The current run is extended while the next page keeps the active page
    /// size, continues the physical backing in the same aperture and decodes
    /// to the same attributes.
    ///
    /// # Errors
    /// Tree errors, such as a missing table for the active page size.
    pub fn explore_gmmu(
        range: PmMemRange,
        tree: &mut MmuLevelTree,
        driver: &dyn GmmuDriver,
        buffer: &dyn Buffer,
    ) -> Result<Self, PmError> {
        let virt = tree.virt_base().as_u64();
        let mut helper = Self::new(range);
        let mut cursor = range.offset;
        while cursor < range.end() {
            let page_size = tree.active_page_size(driver, cursor)?;
            let page_end = align_down(virt + cursor, page_size.bytes()) + page_size.bytes() - virt;
            let len = page_end.min(range.end()) - cursor;
            let translation = tree.translate(driver, cursor)?;
            let attrs = MemAttrs::Gmmu(GmmuAttrs::read(tree, driver, cursor, page_size)?);
            let backing = Backing {
                mem_handle: buffer.mem_handle(),
                mem_offset: buffer.phys_offset() + cursor,
                aperture: translation.aperture,
                phys: translation.address,
            };
            helper.extend_or_push(cursor, len, page_size, backing, MappingKind::Gmmu, attrs)?;
            cursor += len;
        }
        log::debug!("explored {} GMMU mappings in {range:?}", helper.len());
        Ok(helper)
    }

    /// Discover the SMMU mappings of `range`, one driver query per page.
    ///
    /// # Errors
    /// Driver errors.
    pub fn explore_smmu(
        range: PmMemRange,
        driver: &dyn GmmuDriver,
        buffer: &dyn Buffer,
    ) -> Result<Self, PmError> {
        let page_size = buffer.page_size();
        let mut helper = Self::new(range);
        let mut cursor = range.offset;
        while cursor < range.end() {
            let len = page_size.bytes().min(range.end() - cursor);
            let pte = driver.get_pte_info(&PteInfoParams {
                vaspace: buffer.vaspace(),
                va: buffer.virt_base() + cursor,
                page_size,
            })?;
            let attrs = MemAttrs::Smmu(SmmuAttrs {
                valid: pte.valid,
                flags: pte.flags,
            });
            let backing = Backing {
                mem_handle: buffer.mem_handle(),
                mem_offset: buffer.phys_offset() + cursor,
                aperture: pte.aperture,
                phys: pte.address,
            };
            helper.extend_or_push(cursor, len, page_size, backing, MappingKind::Smmu, attrs)?;
            cursor += len;
        }
        log::debug!("explored {} SMMU mappings in {range:?}", helper.len());
        Ok(helper)
    }

    /// A single ATS mapping over `range`, with `nested` GMMU mappings if the
    /// device also keeps page tables for it.
    ///
    /// # Errors
    /// [`PmError::InvalidArgument`] if `nested` covers a different range.
    pub fn explore_ats(
        range: PmMemRange,
        buffer: &dyn Buffer,
        nested: Option<Self>,
    ) -> Result<Self, PmError> {
        let aperture = buffer.location().aperture();
        let backing = Backing {
            mem_handle: buffer.mem_handle(),
            mem_offset: buffer.phys_offset() + range.offset,
            aperture,
            phys: buffer.phys_addr(range.offset),
        };
        let mut mapping = PmMemMapping::new(
            range,
            buffer.page_size(),
            backing,
            MappingKind::Ats,
            MemAttrs::Ats(AtsAttrs { aperture }),
        );
        if let Some(nested) = nested {
            if nested.range() != range {
                return Err(PmError::InvalidArgument("nested mappings cover a different range"));
            }
            mapping.set_children(nested);
        }
        let mut helper = Self::new(range);
        helper.push(mapping)?;
        Ok(helper)
    }

    fn extend_or_push(
        &mut self,
        offset: u64,
        len: u64,
        page_size: PageSize,
        backing: Backing,
        kind: MappingKind,
        attrs: MemAttrs,
    ) -> Result<(), PmError> {
        if let Some(last) = self.mappings.last_mut()
            && last.page_size() == page_size
            && last.backing().continues_with(last.size(), &backing)
            && last.attrs().is_same(&attrs)
        {
            last.grow(len);
            return Ok(());
        }
        let range = PmMemRange::new(self.range.surface, offset, len);
        self.push(PmMemMapping::new(range, page_size, backing, kind, attrs))
    }
}
