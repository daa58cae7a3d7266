use crate::segment::{MmuLevelSegment, TableLocation};
use alloc::vec::Vec;
use gmmu_addresses::{GpuVirtualAddress, PageSize};
use gmmu_format::{LevelDesc, MmuLevelIndex, MmuVersion};

/// One level of a surface's tree: segments sorted by offset, disjoint.
#[derive(Debug)]
pub struct MmuLevel {
    desc: &'static LevelDesc,
    segments: Vec<MmuLevelSegment>,
}

impl MmuLevel {
    #[must_use]
    pub const fn new(desc: &'static LevelDesc) -> Self {
        Self {
            desc,
            segments: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> MmuLevelIndex {
        self.desc.index
    }

    #[inline]
    #[must_use]
    pub const fn desc(&self) -> &'static LevelDesc {
        self.desc
    }

    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[MmuLevelSegment] {
        &self.segments
    }

    #[inline]
    pub fn segments_mut(&mut self) -> &mut [MmuLevelSegment] {
        &mut self.segments
    }

    /// Whether any part of `[start, end)` is already covered by a segment.
    #[must_use]
    pub fn covers_any(&self, start: u64, end: u64) -> bool {
        self.segments.iter().any(|s| s.range().start < end && start < s.range().end)
    }

    /// Position of the segment containing `offset`.
    #[must_use]
    pub fn segment_index(&self, offset: u64) -> Option<usize> {
        let i = self.segments.partition_point(|s| s.range().end <= offset);
        (i < self.segments.len() && self.segments[i].contains(offset)).then_some(i)
    }

    #[must_use]
    pub fn segment(&self, offset: u64) -> Option<&MmuLevelSegment> {
        self.segment_index(offset).map(|i| &self.segments[i])
    }

    pub fn segment_mut(&mut self, offset: u64) -> Option<&mut MmuLevelSegment> {
        self.segment_index(offset).map(|i| &mut self.segments[i])
    }

    /// Add the part of `[start, end)` not covered yet, backed by `table`.
    ///
    /// Returns whether anything was added.
    pub(crate) fn add_table(
        &mut self,
        version: MmuVersion,
        virt_base: GpuVirtualAddress,
        start: u64,
        end: u64,
        table: TableLocation,
        active: PageSize,
    ) -> bool {
        if start >= end || self.covers_any(start, end) {
            return false;
        }
        log::debug!("{:?}: table {table:?} for [{start:#x}, {end:#x})", self.desc.index);
        self.insert(MmuLevelSegment::new(
            self.desc,
            version,
            virt_base,
            start..end,
            Some(table),
            active,
        ));
        true
    }

    fn insert(&mut self, segment: MmuLevelSegment) {
        let at = self.segments.partition_point(|s| s.range().start < segment.range().start);
        if at > 0 && self.segments[at - 1].try_merge(&segment) {
            return;
        }
        self.segments.insert(at, segment);
    }

    /// Close every hole in `[0, size)` with a detached segment.
    pub(crate) fn fill_gaps(
        &mut self,
        version: MmuVersion,
        virt_base: GpuVirtualAddress,
        size: u64,
        active: PageSize,
    ) {
        let mut holes = Vec::new();
        let mut cursor = 0;
        for s in &self.segments {
            if s.range().start > cursor {
                holes.push(cursor..s.range().start);
            }
            cursor = cursor.max(s.range().end);
        }
        if cursor < size {
            holes.push(cursor..size);
        }
        for hole in holes {
            log::trace!("{:?}: no table for [{:#x}, {:#x})", self.desc.index, hole.start, hole.end);
            let at = self.segments.partition_point(|s| s.range().start < hole.start);
            let gap = MmuLevelSegment::new(self.desc, version, virt_base, hole, None, active);
            self.segments.insert(at, gap);
        }
    }

    /// Whether the segments exactly partition `[0, size)`.
    #[must_use]
    pub fn is_partition(&self, size: u64) -> bool {
        let mut cursor = 0;
        for s in &self.segments {
            if s.range().start != cursor {
                return false;
            }
            cursor = s.range().end;
        }
        cursor == size
    }

    /// Whether any segment has a table.
    #[must_use]
    pub fn has_tables(&self) -> bool {
        self.segments.iter().any(MmuLevelSegment::is_attached)
    }
}
