//! # Level trees
//!
//! An [`MmuLevelTree`] holds one [`MmuLevel`] per level of the device's
//! format, each partitioned into segments over the surface's offset range.
//! Exploration asks the driver where the tables are; it runs once per tree,
//! since tables are not re-allocated while the surface lives. Entry contents
//! are not cached across explorations; segments load them on first access.

use crate::driver::{PageLevelDesc, PageLevelInfoParams, PdeInfoParams};
use crate::modify::{LowerTable, PmMmuLevel};
use crate::registry::TreeKey;
use crate::segment::{PdeHalf, StagedEntry, TableLocation};
use crate::{GmmuDriver, MmuError, MmuLevel};
use alloc::vec::Vec;
use gmmu_addresses::{Aperture, GpuVirtualAddress, PageSize, PhysicalAddress, align_down};
use gmmu_format::{EntryRole, MmuFormat, MmuLevelIndex};

/// Exploration progress.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TreeState {
    Unexplored,
    Exploring,
    Explored,
}

/// Which driver query populated the tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueryPath {
    /// One call per leaf table, reporting every level above it.
    PageLevelInfo,
    /// One call per PDE0 entry, reporting PDE0 and the leaf tables.
    LegacyPdeInfo,
}

pub struct MmuLevelTree {
    key: TreeKey,
    format: &'static MmuFormat,
    size: u64,
    seed: PageSize,
    state: TreeState,
    path: Option<QueryPath>,
    levels: Vec<MmuLevel>,
}

impl MmuLevelTree {
    /// An unexplored tree over `size` bytes starting at `key.virt_base`.
    ///
    /// `seed` is the page size the surface was allocated with; it resolves
    /// ambiguous dual-purpose entries until they are retyped.
    #[must_use]
    pub fn new(key: TreeKey, format: &'static MmuFormat, size: u64, seed: PageSize) -> Self {
        Self {
            key,
            format,
            size,
            seed,
            state: TreeState::Unexplored,
            path: None,
            levels: format.levels.iter().map(MmuLevel::new).collect(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn key(&self) -> TreeKey {
        self.key
    }

    #[inline]
    #[must_use]
    pub const fn format(&self) -> &'static MmuFormat {
        self.format
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn virt_base(&self) -> GpuVirtualAddress {
        self.key.virt_base
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> TreeState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn query_path(&self) -> Option<QueryPath> {
        self.path
    }

    #[must_use]
    pub fn levels(&self) -> &[MmuLevel] {
        &self.levels
    }

    #[must_use]
    pub fn level(&self, index: MmuLevelIndex) -> Option<&MmuLevel> {
        self.levels.iter().find(|l| l.index() == index)
    }

    pub fn level_mut(&mut self, index: MmuLevelIndex) -> Option<&mut MmuLevel> {
        self.levels.iter_mut().find(|l| l.index() == index)
    }

    fn require_level(&mut self, index: MmuLevelIndex) -> Result<&mut MmuLevel, MmuError> {
        self.level_mut(index)
            .ok_or(MmuError::SoftwareError("level does not exist in this format"))
    }

    /// Mutation facade over one level.
    ///
    /// # Errors
    /// [`MmuError::SoftwareError`] if the tree is unexplored or the format has
    /// no such level.
    pub fn pm_level(&mut self, index: MmuLevelIndex) -> Result<PmMmuLevel<'_>, MmuError> {
        if self.state != TreeState::Explored {
            return Err(MmuError::SoftwareError("tree used before exploration"));
        }
        let vaspace = self.key.vaspace;
        let version = self.format.version;
        let level = self.require_level(index)?;
        Ok(PmMmuLevel::new(level, version, vaspace))
    }

    /// Discover every table backing the surface.
    ///
    /// Uses [`GmmuDriver::get_page_level_info`] unless `prefer_legacy` is set
    /// or the driver does not support it, in which case
    /// [`GmmuDriver::get_pde_info`] is walked per PDE0 entry. Repeat calls are
    /// no-ops.
    ///
    /// # Errors
    /// Driver errors other than "not supported" on the modern path. On error
    /// the tree is left unexplored.
    pub fn explore(
        &mut self,
        driver: &dyn GmmuDriver,
        prefer_legacy: bool,
    ) -> Result<(), MmuError> {
        match self.state {
            TreeState::Explored => return Ok(()),
            TreeState::Exploring => {
                return Err(MmuError::SoftwareError("re-entrant tree exploration"));
            }
            TreeState::Unexplored => {}
        }
        self.state = TreeState::Exploring;
        log::info!(
            "exploring {:?} tree at {} (+{:#x})",
            self.format.version,
            self.key.virt_base,
            self.size
        );

        let result = if prefer_legacy {
            self.explore_legacy(driver).map(|()| QueryPath::LegacyPdeInfo)
        } else {
            match self.explore_modern(driver) {
                Err(MmuError::Driver(e)) if e.is_not_supported() => {
                    log::warn!(
                        "page level query unavailable ({e}), falling back to per-PDE queries"
                    );
                    self.reset_levels();
                    self.explore_legacy(driver).map(|()| QueryPath::LegacyPdeInfo)
                }
                other => other.map(|()| QueryPath::PageLevelInfo),
            }
        };

        match result {
            Ok(path) => {
                let version = self.format.version;
                for level in &mut self.levels {
                    level.fill_gaps(version, self.key.virt_base, self.size, self.seed);
                }
                self.path = Some(path);
                self.state = TreeState::Explored;
                Ok(())
            }
            Err(e) => {
                self.reset_levels();
                self.state = TreeState::Unexplored;
                Err(e)
            }
        }
    }

    fn reset_levels(&mut self) {
        self.levels = self.format.levels.iter().map(MmuLevel::new).collect();
    }

    fn explore_modern(&mut self, driver: &dyn GmmuDriver) -> Result<(), MmuError> {
        let base = self.key.virt_base.as_u64();
        let end = base + self.size;
        let page_sizes: Vec<PageSize> = self.format.page_sizes().collect();

        for page_size in page_sizes {
            let Some(leaf) = self
                .format
                .leaf_level(page_size)
                .and_then(|i| self.format.level(i))
            else {
                continue;
            };
            let step = leaf.table_span();
            let mut va = align_down(base, step);
            while va < end {
                let params = PageLevelInfoParams {
                    vaspace: self.key.vaspace,
                    va: GpuVirtualAddress::new(va.max(base)),
                    page_size,
                };
                let info = driver.get_page_level_info(&params)?;
                for desc in &info.levels {
                    self.add_reported(desc, params.va);
                }
                va += step;
            }
        }
        Ok(())
    }

    fn explore_legacy(&mut self, driver: &dyn GmmuDriver) -> Result<(), MmuError> {
        let Some(pde0) = self.format.level(MmuLevelIndex::Pde0) else {
            return Err(MmuError::SoftwareError("format has no PDE0 level"));
        };
        let base = self.key.virt_base.as_u64();
        let end = base + self.size;
        let step = pde0.coverage();

        let mut va = align_down(base, step);
        while va < end {
            let params = PdeInfoParams {
                vaspace: self.key.vaspace,
                va: GpuVirtualAddress::new(va.max(base)),
            };
            let info = driver.get_pde_info(&params)?;
            for desc in &info.levels {
                self.add_reported(desc, params.va);
            }
            va += step;
        }
        Ok(())
    }

    /// Record a table reported for `va`, clipped to the surface.
    fn add_reported(&mut self, reported: &PageLevelDesc, va: GpuVirtualAddress) {
        let Some(desc) = self.format.level(reported.level) else {
            log::warn!("driver reported {:?}, which this format does not have", reported.level);
            return;
        };
        let span = desc.table_span();
        let base = self.key.virt_base.as_u64();
        let table_start = align_down(va.as_u64(), span);
        let start = table_start.max(base) - base;
        let end = (table_start + span).min(base + self.size) - base;

        let version = self.format.version;
        let (virt_base, seed) = (self.key.virt_base, self.seed);
        let table = TableLocation {
            aperture: reported.aperture,
            base: reported.table,
        };
        if let Some(level) = self.level_mut(reported.level) {
            level.add_table(version, virt_base, start, end, table, seed);
        }
    }

    fn staged(
        &mut self,
        driver: &dyn GmmuDriver,
        index: MmuLevelIndex,
        offset: u64,
    ) -> Result<Option<StagedEntry>, MmuError> {
        let Some(segment) = self.level_mut(index).and_then(|l| l.segment_mut(offset)) else {
            return Ok(None);
        };
        if !segment.is_attached() {
            return Ok(None);
        }
        segment.entry(driver, offset).map(Some)
    }

    fn leaf_valid(
        &mut self,
        driver: &dyn GmmuDriver,
        index: MmuLevelIndex,
        offset: u64,
    ) -> Result<bool, MmuError> {
        Ok(self
            .staged(driver, index, offset)?
            .is_some_and(|e| e.role == EntryRole::Pte && e.lo.valid))
    }

    /// Page size the hardware currently uses to translate `offset`.
    ///
    /// A leaf at PDE1 or PDE0 wins; below PDE0 the connected and valid halves
    /// decide, preferring small pages when both are live. Without any signal
    /// the tree's seed page size is returned.
    ///
    /// # Errors
    /// [`MmuError::InvalidArgument`] for offsets outside the surface; load
    /// errors.
    pub fn active_page_size(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
    ) -> Result<PageSize, MmuError> {
        if offset >= self.size {
            return Err(MmuError::InvalidArgument("offset outside surface"));
        }
        if self.format.level(MmuLevelIndex::Pde1).is_some_and(|d| d.leaf_page_size.is_some())
            && let Some(e) = self.staged(driver, MmuLevelIndex::Pde1, offset)?
            && e.role == EntryRole::Pte
        {
            return Ok(PageSize::Size512M);
        }

        let pde0 = self.staged(driver, MmuLevelIndex::Pde0, offset)?;
        if let Some(e) = pde0
            && e.role == EntryRole::Pte
        {
            return Ok(PageSize::Size2M);
        }
        let (big_connected, small_connected) =
            pde0.map_or((true, true), |e| (e.lo.valid, e.hi.valid));

        let big = big_connected && self.leaf_valid(driver, MmuLevelIndex::PteBig, offset)?;
        let small = small_connected && self.leaf_valid(driver, MmuLevelIndex::PteSmall, offset)?;
        Ok(match (big, small) {
            (_, true) => PageSize::Size4K,
            (true, false) => PageSize::Size64K,
            (false, false) => match (big_connected, small_connected) {
                (true, false) => PageSize::Size64K,
                (false, true) => PageSize::Size4K,
                _ => self.seed,
            },
        })
    }

    /// Leaf entry translating `offset` at page size `page_size`.
    ///
    /// # Errors
    /// [`MmuError::NoPageTable`] if that leaf level has no table there.
    pub fn leaf_entry(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        page_size: PageSize,
    ) -> Result<StagedEntry, MmuError> {
        let index = self
            .format
            .leaf_level(page_size)
            .ok_or(MmuError::Unsupported("page size not supported by this format"))?;
        let segment = self
            .level_mut(index)
            .and_then(|l| l.segment_mut(offset))
            .ok_or(MmuError::InvalidArgument("offset outside surface"))?;
        segment.entry(driver, offset)
    }

    /// Resolve `offset` through the live tables.
    ///
    /// # Errors
    /// See [`active_page_size`](Self::active_page_size) and
    /// [`leaf_entry`](Self::leaf_entry).
    pub fn translate(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
    ) -> Result<Translation, MmuError> {
        let page_size = self.active_page_size(driver, offset)?;
        let entry = self.leaf_entry(driver, offset, page_size)?;
        if entry.role != EntryRole::Pte {
            return Err(MmuError::SoftwareError("active leaf level holds a directory entry"));
        }
        let within = (self.key.virt_base.as_u64() + offset) & (page_size.bytes() - 1);
        Ok(Translation {
            page_size,
            entry,
            aperture: entry.lo.aperture,
            address: entry.lo.address + within,
        })
    }

    /// Table of `level` that translates `offset`.
    #[must_use]
    pub fn table_at(&self, level: MmuLevelIndex, offset: u64) -> Option<TableLocation> {
        self.level(level)?.segment(offset)?.table()
    }

    /// Attached tables of `lower`, for `CONNECT_LOWER` on its parent.
    #[must_use]
    pub fn lower_tables(&self, lower: MmuLevelIndex) -> Vec<LowerTable> {
        self.level(lower).map_or_else(Vec::new, |level| {
            level
                .segments()
                .iter()
                .filter_map(|s| {
                    s.table().map(|table| LowerTable {
                        start: s.range().start,
                        end: s.range().end,
                        table,
                    })
                })
                .collect()
        })
    }

    /// Parent level and pointer half that lead to tables of `level`.
    #[must_use]
    pub fn parent_link(&self, level: MmuLevelIndex) -> Option<(MmuLevelIndex, PdeHalf)> {
        self.format.parent(level).map(|p| (p, PdeHalf::for_lower(level)))
    }

    /// Drop loaded entries of every clean segment.
    ///
    /// # Errors
    /// [`MmuError::SoftwareError`] if any segment holds unflushed changes.
    pub fn discard_cached(&mut self) -> Result<(), MmuError> {
        for level in &mut self.levels {
            for segment in level.segments_mut() {
                segment.discard()?;
            }
        }
        Ok(())
    }
}

/// Result of [`MmuLevelTree::translate`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    pub page_size: PageSize,
    pub entry: StagedEntry,
    pub aperture: Aperture,
    /// Physical address of the byte at the translated offset.
    pub address: PhysicalAddress,
}

impl core::fmt::Debug for MmuLevelTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmuLevelTree")
            .field("key", &self.key)
            .field("version", &self.format.version)
            .field("size", &self.size)
            .field("state", &self.state)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
