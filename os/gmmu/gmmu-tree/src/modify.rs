//! # Batched entry mutation
//!
//! [`PmMmuLevel::modify_entries`] applies a set of [`EntryOps`] to every entry
//! of one level that translates `[offset, offset + size)`. The range is cut
//! at segment boundaries and each chunk is processed in a fixed order:
//!
//! 1. `RETYPE`
//! 2. `SET_VALID` / `CLEAR_VALID`
//! 3. `SET_CACHE` / `CLEAR_CACHE`
//! 4. `SET_SPARSE` / `CLEAR_SPARSE`
//! 5. `SET_ATOMIC_DISABLE` / `CLEAR_ATOMIC_DISABLE`
//! 6. `SET_READ_ONLY` / `CLEAR_READ_ONLY`
//! 7. `SET_PRIVILEGE` / `CLEAR_PRIVILEGE`
//! 8. `SET_ACE` / `CLEAR_ACE`
//! 9. `CONNECT_LOWER`
//! 10. `SET_PHYS`
//!
//! On packed-PCF formats steps 3 to 8 are collected into one [`PcfRequest`]
//! that is committed after step 10. Ops the format cannot apply stay in the
//! pending set and fail the chunk with [`MmuError::UnsupportedOps`]; chunks
//! processed before the failure keep their changes.
//!
//! Each chunk is flushed before the next one starts. Out-of-band writes are
//! followed by a TLB invalidation unless deferred; in-band writes never
//! invalidate, since the patches have not executed yet.

use crate::channel::CommandChannel;
use crate::driver::InvalidateTlbParams;
use crate::segment::{MmuLevelSegment, PcfFetch, PdeHalf, TableLocation};
use crate::{GmmuDriver, MmuError, MmuLevel};
use bitflags::bitflags;
use gmmu_addresses::{Aperture, PhysicalAddress, VaSpaceHandle};
use gmmu_format::pcf::PcfRequest;
use gmmu_format::{EntryRole, MmuLevelIndex, MmuVersion, PcfBit};

bitflags! {
    /// Operations of one [`PmMmuLevel::modify_entries`] call.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct EntryOps: u32 {
        const RETYPE = 1 << 0;
        const SET_VALID = 1 << 1;
        const CLEAR_VALID = 1 << 2;
        const SET_CACHE = 1 << 3;
        const CLEAR_CACHE = 1 << 4;
        const SET_SPARSE = 1 << 5;
        const CLEAR_SPARSE = 1 << 6;
        const SET_ATOMIC_DISABLE = 1 << 7;
        const CLEAR_ATOMIC_DISABLE = 1 << 8;
        const SET_READ_ONLY = 1 << 9;
        const CLEAR_READ_ONLY = 1 << 10;
        const SET_PRIVILEGE = 1 << 11;
        const CLEAR_PRIVILEGE = 1 << 12;
        /// Access counting; packed-PCF formats only.
        const SET_ACE = 1 << 13;
        const CLEAR_ACE = 1 << 14;
        const CONNECT_LOWER = 1 << 15;
        const SET_PHYS = 1 << 16;

        // Bits from newer callers are kept and reported as unsupported.
        const _ = !0;
    }
}

impl EntryOps {
    /// Set/clear pairs, in application order.
    const PAIRS: [(Self, Self); 7] = [
        (Self::SET_VALID, Self::CLEAR_VALID),
        (Self::SET_CACHE, Self::CLEAR_CACHE),
        (Self::SET_SPARSE, Self::CLEAR_SPARSE),
        (Self::SET_ATOMIC_DISABLE, Self::CLEAR_ATOMIC_DISABLE),
        (Self::SET_READ_ONLY, Self::CLEAR_READ_ONLY),
        (Self::SET_PRIVILEGE, Self::CLEAR_PRIVILEGE),
        (Self::SET_ACE, Self::CLEAR_ACE),
    ];

    /// The op that sets (`true`) or clears one attribute.
    #[must_use]
    pub const fn for_bit(bit: PcfBit, value: bool) -> Option<Self> {
        let (set, clear) = match bit {
            PcfBit::Uncached => (Self::CLEAR_CACHE, Self::SET_CACHE),
            PcfBit::Sparse => (Self::SET_SPARSE, Self::CLEAR_SPARSE),
            PcfBit::NoAtomic => (Self::SET_ATOMIC_DISABLE, Self::CLEAR_ATOMIC_DISABLE),
            PcfBit::ReadOnly => (Self::SET_READ_ONLY, Self::CLEAR_READ_ONLY),
            PcfBit::Privilege => (Self::SET_PRIVILEGE, Self::CLEAR_PRIVILEGE),
            PcfBit::Ace => (Self::SET_ACE, Self::CLEAR_ACE),
            PcfBit::NoValid4kPage | PcfBit::MappingNowhere | PcfBit::AtsNotAllowed => return None,
        };
        Some(if value { set } else { clear })
    }

    /// Reject requests that both set and clear one attribute.
    ///
    /// # Errors
    /// [`MmuError::BadParameter`] naming nothing more specific than the
    /// conflict; the ops are in the log.
    pub fn check_conflicts(self) -> Result<(), MmuError> {
        for (set, clear) in Self::PAIRS {
            if self.contains(set | clear) {
                log::debug!("conflicting ops {:?}", set | clear);
                return Err(MmuError::BadParameter("op set both sets and clears one attribute"));
            }
        }
        Ok(())
    }
}

/// Tables to attach with `CONNECT_LOWER`, by the surface range they translate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LowerTable {
    pub start: u64,
    pub end: u64,
    pub table: TableLocation,
}

/// Arguments of the ops that need more than a flag.
#[derive(Copy, Clone, Debug)]
pub struct EntryArgs<'a> {
    /// Target role of `RETYPE`.
    pub role: EntryRole,
    /// First physical page of `SET_PHYS`; later entries follow contiguously.
    pub phys: Option<(Aperture, PhysicalAddress)>,
    /// Pointer half written by `CONNECT_LOWER`.
    pub half: PdeHalf,
    /// Tables for `CONNECT_LOWER`; each entry uses the one covering it.
    pub lower: &'a [LowerTable],
}

impl Default for EntryArgs<'_> {
    fn default() -> Self {
        Self {
            role: EntryRole::Pte,
            phys: None,
            half: PdeHalf::Lo,
            lower: &[],
        }
    }
}

/// How changes reach hardware.
#[derive(Default)]
pub struct WriteMode<'c> {
    /// Queue changes on a command channel instead of writing directly.
    pub channel: Option<&'c mut dyn CommandChannel>,
    /// Skip the TLB invalidation after direct writes.
    pub defer_tlb_invalidate: bool,
    /// Set when changes were written but the TLB was not invalidated.
    pub invalidate_pending: bool,
}

impl<'c> WriteMode<'c> {
    /// Direct writes, invalidating after each call.
    #[must_use]
    pub fn direct() -> Self {
        Self::default()
    }

    /// Direct writes; the caller invalidates later.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            defer_tlb_invalidate: true,
            ..Self::default()
        }
    }

    /// Queued writes on `channel`.
    #[must_use]
    pub fn in_band(channel: &'c mut dyn CommandChannel) -> Self {
        Self {
            channel: Some(channel),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_in_band(&self) -> bool {
        self.channel.is_some()
    }
}

impl core::fmt::Debug for WriteMode<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteMode")
            .field("in_band", &self.is_in_band())
            .field("defer_tlb_invalidate", &self.defer_tlb_invalidate)
            .field("invalidate_pending", &self.invalidate_pending)
            .finish()
    }
}

/// Mutation facade over one [`MmuLevel`] of an explored tree.
pub struct PmMmuLevel<'t> {
    level: &'t mut MmuLevel,
    version: MmuVersion,
    vaspace: VaSpaceHandle,
}

impl<'t> PmMmuLevel<'t> {
    pub(crate) const fn new(
        level: &'t mut MmuLevel,
        version: MmuVersion,
        vaspace: VaSpaceHandle,
    ) -> Self {
        Self { level, version, vaspace }
    }

    #[must_use]
    pub const fn index(&self) -> MmuLevelIndex {
        self.level.index()
    }

    /// Underlying level, for reads.
    #[must_use]
    pub fn level(&mut self) -> &mut MmuLevel {
        &mut *self.level
    }

    /// Apply `ops` to the entries translating `[offset, offset + size)`.
    ///
    /// # Errors
    /// - [`MmuError::BadParameter`] for conflicting ops or missing arguments.
    /// - [`MmuError::UnsupportedOps`] for ops left after a chunk.
    /// - Errors of the segment operations, flush and TLB invalidation.
    pub fn modify_entries(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        ops: EntryOps,
        args: &EntryArgs<'_>,
        mode: &mut WriteMode<'_>,
    ) -> Result<(), MmuError> {
        ops.check_conflicts()?;
        if ops.contains(EntryOps::SET_PHYS) && args.phys.is_none() {
            return Err(MmuError::BadParameter("SET_PHYS without a physical address"));
        }
        if size == 0 {
            return Ok(());
        }

        let end = offset
            .checked_add(size)
            .ok_or(MmuError::InvalidArgument("range wraps around"))?;
        let index = self.level.index();
        log::debug!("{index:?} [{offset:#x}, {end:#x}) {ops:?} {mode:?}");

        let mut written = 0;
        let applied = self.apply_range(driver, offset, end, ops, args, mode, &mut written);
        if written == 0 {
            return applied;
        }
        // Chunks flushed before a failure are live in memory.
        let invalidated = self.after_write(driver, mode);
        applied.and(invalidated)
    }

    /// Apply and flush `[offset, end)` chunk by chunk, counting entries
    /// written into `written` even when a later chunk fails.
    #[allow(clippy::too_many_arguments)]
    fn apply_range(
        &mut self,
        driver: &dyn GmmuDriver,
        offset: u64,
        end: u64,
        ops: EntryOps,
        args: &EntryArgs<'_>,
        mode: &mut WriteMode<'_>,
        written: &mut usize,
    ) -> Result<(), MmuError> {
        let index = self.level.index();
        let mut cursor = offset;
        while cursor < end {
            let i = self
                .level
                .segment_index(cursor)
                .ok_or(MmuError::InvalidArgument("range exceeds surface"))?;
            let segment = &mut self.level.segments_mut()[i];
            let chunk = (end - cursor).min(segment.range().end - cursor);
            let phys = args
                .phys
                .map(|(aperture, address)| (aperture, address + (cursor - offset)));

            let pending =
                Self::apply_chunk(self.version, segment, driver, cursor, chunk, ops, args, phys)?;
            if !pending.is_empty() {
                return Err(MmuError::UnsupportedOps { level: index, ops: pending });
            }
            *written += segment.flush(driver, mode.channel.as_deref_mut())?;
            cursor += chunk;
        }
        Ok(())
    }

    /// Invalidate the TLB after entries were written, or leave it pending
    /// in `mode`.
    fn after_write(
        &self,
        driver: &dyn GmmuDriver,
        mode: &mut WriteMode<'_>,
    ) -> Result<(), MmuError> {
        if mode.is_in_band() {
            log::warn!(
                "TLB invalidation for {:?} left to the caller until the channel drains",
                self.vaspace
            );
            mode.invalidate_pending = true;
        } else if mode.defer_tlb_invalidate {
            mode.invalidate_pending = true;
        } else {
            driver.invalidate_tlb(&InvalidateTlbParams { vaspace: self.vaspace })?;
        }
        Ok(())
    }

    /// One chunk inside one segment; returns the ops left unapplied.
    #[allow(clippy::too_many_arguments)]
    fn apply_chunk(
        version: MmuVersion,
        segment: &mut MmuLevelSegment,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        ops: EntryOps,
        args: &EntryArgs<'_>,
        phys: Option<(Aperture, PhysicalAddress)>,
    ) -> Result<EntryOps, MmuError> {
        let mut pending = ops;
        let packed = version.uses_pcf();
        let mut request = PcfRequest::new();

        if pending.contains(EntryOps::RETYPE) {
            segment.retype(driver, offset, size, args.role)?;
            pending.remove(EntryOps::RETYPE);
        }
        if let Some(valid) = take_pair(&mut pending, EntryOps::SET_VALID, EntryOps::CLEAR_VALID) {
            segment.set_valid(driver, offset, size, valid)?;
        }
        if let Some(cached) = take_pair(&mut pending, EntryOps::SET_CACHE, EntryOps::CLEAR_CACHE) {
            if packed {
                request.set_bit(PcfBit::Uncached, !cached);
            } else {
                segment.set_cache(driver, offset, size, cached)?;
            }
        }
        if let Some(sparse) =
            take_pair(&mut pending, EntryOps::SET_SPARSE, EntryOps::CLEAR_SPARSE)
        {
            if packed {
                if sparse {
                    segment.set_valid(driver, offset, size, false)?;
                }
                request.set_bit(PcfBit::Sparse, sparse);
            } else {
                segment.set_sparse(driver, offset, size, sparse)?;
            }
        }

        // V1 has no atomic-disable bit; leave the op pending there.
        if version != MmuVersion::V1
            && let Some(disable) = take_pair(
                &mut pending,
                EntryOps::SET_ATOMIC_DISABLE,
                EntryOps::CLEAR_ATOMIC_DISABLE,
            )
        {
            if packed {
                request.set_bit(PcfBit::NoAtomic, disable);
            } else {
                segment.set_atomic_disable(driver, offset, size, disable)?;
            }
        }
        if let Some(read_only) =
            take_pair(&mut pending, EntryOps::SET_READ_ONLY, EntryOps::CLEAR_READ_ONLY)
        {
            if packed {
                request.set_bit(PcfBit::ReadOnly, read_only);
            } else {
                segment.set_read_only(driver, offset, size, read_only)?;
            }
        }
        if let Some(privileged) =
            take_pair(&mut pending, EntryOps::SET_PRIVILEGE, EntryOps::CLEAR_PRIVILEGE)
        {
            if packed {
                request.set_bit(PcfBit::Privilege, privileged);
            } else {
                segment.set_privilege(driver, offset, size, privileged)?;
            }
        }
        if packed
            && let Some(ace) = take_pair(&mut pending, EntryOps::SET_ACE, EntryOps::CLEAR_ACE)
        {
            request.set_bit(PcfBit::Ace, ace);
        }

        if pending.contains(EntryOps::CONNECT_LOWER) {
            Self::connect_chunk(segment, driver, offset, size, args)?;
            pending.remove(EntryOps::CONNECT_LOWER);
        }
        if pending.contains(EntryOps::SET_PHYS)
            && let Some((aperture, address)) = phys
        {
            segment.set_contiguous_phys(driver, offset, size, aperture, address)?;
            pending.remove(EntryOps::SET_PHYS);
        }

        if !request.is_empty() {
            segment.set_pcf(driver, offset, size, &request, PcfFetch::FetchCache)?;
        }
        Ok(pending)
    }

    fn connect_chunk(
        segment: &mut MmuLevelSegment,
        driver: &dyn GmmuDriver,
        offset: u64,
        size: u64,
        args: &EntryArgs<'_>,
    ) -> Result<(), MmuError> {
        let end = offset + size;
        let mut cursor = offset;
        while cursor < end {
            let lower = args
                .lower
                .iter()
                .find(|t| t.start <= cursor && cursor < t.end)
                .ok_or(MmuError::NoPageTable {
                    level: segment.level(),
                    offset: cursor,
                })?;
            let step = lower.end.min(end) - cursor;
            segment.connect_lower(driver, cursor, step, args.half, lower.table)?;
            cursor += step;
        }
        Ok(())
    }
}

/// Remove a set/clear pair from `ops`; `Some(true)` for set.
fn take_pair(ops: &mut EntryOps, set: EntryOps, clear: EntryOps) -> Option<bool> {
    let value = if ops.contains(set) {
        true
    } else if ops.contains(clear) {
        false
    } else {
        return None;
    };
    ops.remove(set | clear);
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_pairs_are_rejected() {
        assert!(EntryOps::SET_VALID.check_conflicts().is_ok());
        assert!((EntryOps::SET_VALID | EntryOps::CLEAR_CACHE).check_conflicts().is_ok());
        assert_eq!(
            (EntryOps::SET_READ_ONLY | EntryOps::CLEAR_READ_ONLY).check_conflicts(),
            Err(MmuError::BadParameter("op set both sets and clears one attribute"))
        );
    }

    #[test]
    fn pairs_are_taken_once() {
        let mut ops = EntryOps::SET_SPARSE | EntryOps::SET_PHYS;
        assert_eq!(take_pair(&mut ops, EntryOps::SET_SPARSE, EntryOps::CLEAR_SPARSE), Some(true));
        assert_eq!(take_pair(&mut ops, EntryOps::SET_SPARSE, EntryOps::CLEAR_SPARSE), None);
        assert_eq!(ops, EntryOps::SET_PHYS);
    }

    #[test]
    fn unknown_bits_survive() {
        let ops = EntryOps::from_bits_retain(1 << 30) | EntryOps::SET_VALID;
        let mut pending = ops;
        take_pair(&mut pending, EntryOps::SET_VALID, EntryOps::CLEAR_VALID);
        assert_eq!(pending.bits(), 1 << 30);
    }

    #[test]
    fn ops_for_pcf_bits() {
        assert_eq!(EntryOps::for_bit(PcfBit::Uncached, true), Some(EntryOps::CLEAR_CACHE));
        assert_eq!(EntryOps::for_bit(PcfBit::ReadOnly, false), Some(EntryOps::CLEAR_READ_ONLY));
        assert_eq!(EntryOps::for_bit(PcfBit::MappingNowhere, true), None);
    }
}
