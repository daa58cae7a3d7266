use gmmu_addresses::{Aperture, Location, PageSize, PhysicalAddress, VaSpaceHandle};
use gmmu_format::entry::v2::ADDRESS_LIMIT;
use gmmu_format::{EntryRole, FormatError, GmmuEntryBits, MmuFormat, MmuLevelIndex};
use gmmu_sim::{SimBuffer, SimChannel, SimGpu, init_test_logging};
use gmmu_surface::Buffer;
use gmmu_tree::{
    EntryArgs, EntryOps, GmmuDriver, MmuError, MmuLevelTree, TreeKey, VaSpaceKind, WriteMode,
};

struct Fixture {
    gpu: SimGpu,
    vs: VaSpaceHandle,
    buf: SimBuffer,
    tree: MmuLevelTree,
}

fn explored(format: &'static MmuFormat, page_size: PageSize, size: u64) -> Fixture {
    init_test_logging();
    let gpu = SimGpu::new(format);
    let vs = gpu.create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let buf = gpu.alloc(vs, Location::Fb, size, page_size).unwrap();
    let key = TreeKey {
        device: gpu.device_id(),
        mem: buf.mem_handle(),
        virt_base: buf.virt_base(),
        vaspace: vs,
    };
    let mut tree = MmuLevelTree::new(key, gpu.mmu_format(), size, page_size);
    tree.explore(&gpu, false).unwrap();
    gpu.clear_tlb_invalidations();
    Fixture { gpu, vs, buf, tree }
}

/// The leaf entry at `offset` as stored in memory.
fn stored_leaf(f: &Fixture, level: MmuLevelIndex, offset: u64) -> GmmuEntryBits {
    let segment = f.tree.level(level).unwrap().segment(offset).unwrap();
    let at = segment.entry_address_at(offset).unwrap();
    let raw = f.gpu.read_u64(0, segment.table().unwrap().aperture, at).unwrap();
    GmmuEntryBits::decode(f.gpu.mmu_format().version, EntryRole::Pte, raw).unwrap()
}

#[test]
fn attributes_reach_memory_and_invalidate_once() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size4K, 0x4000);
    let mut mode = WriteMode::direct();
    f.tree
        .pm_level(MmuLevelIndex::PteSmall)
        .unwrap()
        .modify_entries(
            &f.gpu,
            0x1000,
            0x2000,
            EntryOps::SET_READ_ONLY | EntryOps::SET_ATOMIC_DISABLE | EntryOps::CLEAR_CACHE,
            &EntryArgs::default(),
            &mut mode,
        )
        .unwrap();

    let t = f.gpu.walk(f.vs, f.buf.virt_base() + 0x1000).unwrap().unwrap();
    assert!(t.entry.read_only && t.entry.atomic_disable && t.entry.uncached);
    assert!(!f.gpu.walk(f.vs, f.buf.virt_base()).unwrap().unwrap().entry.read_only);
    assert!(!f.gpu.walk(f.vs, f.buf.virt_base() + 0x3000).unwrap().unwrap().entry.read_only);
    assert_eq!(f.gpu.tlb_invalidations(), [f.vs]);
    assert!(!mode.invalidate_pending);
}

#[test]
fn atomics_are_unsupported_on_the_oldest_format() {
    let mut f = explored(&MmuFormat::V1, PageSize::Size4K, 0x2000);
    let err = f
        .tree
        .pm_level(MmuLevelIndex::PteSmall)
        .unwrap()
        .modify_entries(
            &f.gpu,
            0,
            0x2000,
            EntryOps::SET_ATOMIC_DISABLE | EntryOps::SET_READ_ONLY,
            &EntryArgs::default(),
            &mut WriteMode::direct(),
        )
        .unwrap_err();
    assert_eq!(
        err,
        MmuError::UnsupportedOps {
            level: MmuLevelIndex::PteSmall,
            ops: EntryOps::SET_ATOMIC_DISABLE
        }
    );
    assert!(!stored_leaf(&f, MmuLevelIndex::PteSmall, 0).read_only);
    assert!(f.gpu.tlb_invalidations().is_empty());
}

#[test]
fn access_counting_needs_a_packed_format() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size64K, 0x2_0000);
    let err = f
        .tree
        .pm_level(MmuLevelIndex::PteBig)
        .unwrap()
        .modify_entries(
            &f.gpu,
            0,
            0x2_0000,
            EntryOps::SET_ACE,
            &EntryArgs::default(),
            &mut WriteMode::direct(),
        )
        .unwrap_err();
    assert_eq!(
        err,
        MmuError::UnsupportedOps {
            level: MmuLevelIndex::PteBig,
            ops: EntryOps::SET_ACE
        }
    );
}

#[test]
fn packed_attributes_are_committed_together() {
    let mut f = explored(&MmuFormat::V3, PageSize::Size64K, 0x4_0000);
    f.tree
        .pm_level(MmuLevelIndex::PteBig)
        .unwrap()
        .modify_entries(
            &f.gpu,
            0,
            0x4_0000,
            EntryOps::SET_READ_ONLY | EntryOps::CLEAR_CACHE | EntryOps::SET_ACE,
            &EntryArgs::default(),
            &mut WriteMode::direct(),
        )
        .unwrap();

    for offset in [0, 0x3_0000] {
        let t = f.gpu.walk(f.vs, f.buf.virt_base() + offset).unwrap().unwrap();
        assert!(t.entry.read_only && t.entry.uncached && t.entry.ace);
        assert_eq!(t.address, f.buf.phys_addr(offset));
    }
}

#[test]
fn sparse_entries_drop_valid_only_attributes() {
    let mut f = explored(&MmuFormat::V3, PageSize::Size64K, 0x2_0000);
    f.tree
        .pm_level(MmuLevelIndex::PteBig)
        .unwrap()
        .modify_entries(
            &f.gpu,
            0,
            0x1_0000,
            EntryOps::SET_SPARSE | EntryOps::SET_ACE,
            &EntryArgs::default(),
            &mut WriteMode::direct(),
        )
        .unwrap();

    let e = stored_leaf(&f, MmuLevelIndex::PteBig, 0);
    assert!(!e.valid);
    assert!(e.sparse);
    assert!(!e.ace);
    assert!(f.gpu.walk(f.vs, f.buf.virt_base()).unwrap().is_none());
    assert!(f.gpu.walk(f.vs, f.buf.virt_base() + 0x1_0000).unwrap().is_some());
}

#[test]
fn physical_remap_follows_the_new_base() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size64K, 0x4_0000);
    let target = f.gpu.alloc_phys(Location::Coherent, 0x2_0000, 0x1_0000).unwrap();
    let args = EntryArgs {
        phys: Some((Location::Coherent.aperture(), target)),
        ..EntryArgs::default()
    };
    f.tree
        .pm_level(MmuLevelIndex::PteBig)
        .unwrap()
        .modify_entries(
            &f.gpu,
            0x1_0000,
            0x2_0000,
            EntryOps::SET_PHYS,
            &args,
            &mut WriteMode::direct(),
        )
        .unwrap();

    let t = f.gpu.walk(f.vs, f.buf.virt_base() + 0x2_0040).unwrap().unwrap();
    assert_eq!(t.entry.aperture, Location::Coherent.aperture());
    assert_eq!(t.address, target + 0x1_0040);
    let t = f.gpu.walk(f.vs, f.buf.virt_base() + 0x3_0000).unwrap().unwrap();
    assert_eq!(t.address, f.buf.phys_addr(0x3_0000));
}

#[test]
fn conflicting_or_incomplete_ops_are_refused() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size4K, 0x1000);
    let mut level = f.tree.pm_level(MmuLevelIndex::PteSmall).unwrap();
    let mut mode = WriteMode::direct();
    let args = EntryArgs::default();
    let both = EntryOps::SET_VALID | EntryOps::CLEAR_VALID;
    assert!(matches!(
        level.modify_entries(&f.gpu, 0, 0x1000, both, &args, &mut mode),
        Err(MmuError::BadParameter(_))
    ));
    assert!(matches!(
        level.modify_entries(&f.gpu, 0, 0x1000, EntryOps::SET_PHYS, &args, &mut mode),
        Err(MmuError::BadParameter(_))
    ));
    assert!(matches!(
        level.modify_entries(&f.gpu, 0, 0x2000, EntryOps::CLEAR_VALID, &args, &mut mode),
        Err(MmuError::InvalidArgument(_))
    ));
}

#[test]
fn deferred_writes_leave_invalidation_pending() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size4K, 0x2000);
    let mut mode = WriteMode::deferred();
    f.tree
        .pm_level(MmuLevelIndex::PteSmall)
        .unwrap()
        .modify_entries(
            &f.gpu,
            0,
            0x2000,
            EntryOps::SET_PRIVILEGE,
            &EntryArgs::default(),
            &mut mode,
        )
        .unwrap();
    assert!(mode.invalidate_pending);
    assert!(f.gpu.tlb_invalidations().is_empty());
    assert!(stored_leaf(&f, MmuLevelIndex::PteSmall, 0x1000).privilege);
}

#[test]
fn in_band_writes_land_when_the_channel_drains() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size64K, 0x2_0000);
    let mut channel = SimChannel::new();
    {
        let mut mode = WriteMode::in_band(&mut channel);
        f.tree
            .pm_level(MmuLevelIndex::PteBig)
            .unwrap()
            .modify_entries(
                &f.gpu,
                0,
                0x2_0000,
                EntryOps::CLEAR_VALID,
                &EntryArgs::default(),
                &mut mode,
            )
            .unwrap();
        assert!(mode.invalidate_pending);
    }
    assert!(f.gpu.tlb_invalidations().is_empty());
    assert!(f.gpu.walk(f.vs, f.buf.virt_base()).unwrap().is_some());

    // Two 8-byte entries, patched 4 bytes at a time.
    assert_eq!(channel.drain(&f.gpu).unwrap(), 4);
    assert!(f.gpu.walk(f.vs, f.buf.virt_base()).unwrap().is_none());
    assert!(f.gpu.walk(f.vs, f.buf.virt_base() + 0x1_0000).unwrap().is_none());
}

/// Remap a 4 MiB surface so the second big-page table would point past the
/// address field.
fn remap_past_the_limit(f: &mut Fixture, mode: &mut WriteMode<'_>) -> MmuError {
    let base = PhysicalAddress::new(ADDRESS_LIMIT - 0x20_0000);
    let args = EntryArgs {
        phys: Some((Aperture::Video, base)),
        ..EntryArgs::default()
    };
    let mut level = f.tree.pm_level(MmuLevelIndex::PteBig).unwrap();
    assert_eq!(level.level().segments().len(), 2);
    level
        .modify_entries(&f.gpu, 0, 0x40_0000, EntryOps::SET_PHYS, &args, mode)
        .unwrap_err()
}

#[test]
fn a_failing_table_still_invalidates_the_tables_written_before() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size64K, 0x40_0000);
    let err = remap_past_the_limit(&mut f, &mut WriteMode::direct());
    assert_eq!(
        err,
        MmuError::Format(FormatError::AddressOutOfRange {
            address: PhysicalAddress::new(ADDRESS_LIMIT)
        })
    );

    let first = stored_leaf(&f, MmuLevelIndex::PteBig, 0x1_0000);
    assert_eq!(first.address, PhysicalAddress::new(ADDRESS_LIMIT - 0x20_0000 + 0x1_0000));
    let second = stored_leaf(&f, MmuLevelIndex::PteBig, 0x20_0000);
    assert_eq!(second.address, f.buf.phys_addr(0x20_0000));
    assert_eq!(f.gpu.tlb_invalidations(), [f.vs]);
}

#[test]
fn a_failing_table_leaves_deferred_invalidation_pending() {
    let mut f = explored(&MmuFormat::V2, PageSize::Size64K, 0x40_0000);
    let mut mode = WriteMode::deferred();
    remap_past_the_limit(&mut f, &mut mode);
    assert!(mode.invalidate_pending);
    assert!(f.gpu.tlb_invalidations().is_empty());
}
