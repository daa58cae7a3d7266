use gmmu_addresses::{Aperture, Location, PageSize, VaSpaceHandle};
use gmmu_format::{MmuFormat, MmuLevelIndex};
use gmmu_sim::{SimBuffer, SimGpu, init_test_logging};
use gmmu_surface::{
    Buffer, DisposalPolicy, MapFlags, MappingKind, MoveOptions, PmConfig, PmContext, PmError,
    PmMemRange, SurfaceId,
};
use gmmu_tree::{DriverError, MmuError, QueryPath, VaSpaceKind, WriteMode};

fn context(gpu: SimGpu, config: PmConfig) -> PmContext<SimGpu> {
    init_test_logging();
    PmContext::new(gpu, config)
}

fn add(
    ctx: &mut PmContext<SimGpu>,
    vs: VaSpaceHandle,
    page_size: PageSize,
    size: u64,
) -> (SimBuffer, SurfaceId) {
    let buf = ctx.device().alloc(vs, Location::Fb, size, page_size).unwrap();
    (buf, ctx.add_surface(buf.boxed()))
}

#[test]
fn mappings_hold_child_references() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (_, id) = add(&mut ctx, vs, PageSize::Size64K, 0x4_0000);

    assert_eq!(ctx.surface(id).unwrap().ref_count().refs(), 1);
    ctx.mappings(id).unwrap();
    // One current and one original mapping.
    let rc = *ctx.surface(id).unwrap().ref_count();
    assert_eq!((rc.refs(), rc.child_refs()), (3, 2));

    let inside = ctx.split(PmMemRange::new(id, 0x1_0000, 0x1_0000)).unwrap();
    assert_eq!(inside, 1..2);
    let rc = *ctx.surface(id).unwrap().ref_count();
    assert_eq!((rc.refs(), rc.child_refs()), (5, 4));
    assert!(ctx.mappings(id).unwrap().check_invariants());

    assert_eq!(ctx.join(PmMemRange::new(id, 0, 0x4_0000)).unwrap(), 2);
    let rc = *ctx.surface(id).unwrap().ref_count();
    assert_eq!((rc.refs(), rc.child_refs()), (3, 2));

    ctx.add_ref(id).unwrap();
    assert!(!ctx.release(id).unwrap());
    assert!(ctx.release(id).unwrap());
    assert_eq!(ctx.surface(id).unwrap_err(), PmError::NoSuchSurface(id));
    assert_eq!(ctx.add_ref(id), Err(PmError::NoSuchSurface(id)));
    assert!(ctx.trees().is_empty());
}

#[test]
fn diverged_surfaces_are_restored_on_release() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (buf, id) = add(&mut ctx, vs, PageSize::Size4K, 0x2000);

    ctx.update_flags(
        PmMemRange::new(id, 0, 0x1000),
        MapFlags::READ_ONLY,
        MapFlags::empty(),
        &mut WriteMode::direct(),
    )
    .unwrap();
    assert!(ctx.device().walk(vs, buf.virt_base()).unwrap().unwrap().entry.read_only);
    ctx.device().clear_tlb_invalidations();

    assert!(ctx.release(id).unwrap());
    assert!(!ctx.device().walk(vs, buf.virt_base()).unwrap().unwrap().entry.read_only);
    assert_eq!(ctx.device().tlb_invalidations(), [vs]);
}

#[test]
fn teardown_restore_can_be_disabled() {
    let config = PmConfig::default().with_restore_on_teardown(false);
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), config);
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (buf, id) = add(&mut ctx, vs, PageSize::Size4K, 0x1000);

    ctx.update_flags(
        PmMemRange::new(id, 0, 0x1000),
        MapFlags::READ_ONLY,
        MapFlags::empty(),
        &mut WriteMode::direct(),
    )
    .unwrap();
    assert!(ctx.release(id).unwrap());
    assert!(ctx.device().walk(vs, buf.virt_base()).unwrap().unwrap().entry.read_only);
}

#[test]
fn end_test_invalidates_each_address_space_once() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let other_vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (_, a) = add(&mut ctx, vs, PageSize::Size4K, 0x2000);
    let (_, b) = add(&mut ctx, vs, PageSize::Size64K, 0x2_0000);
    let (_, untouched) = add(&mut ctx, other_vs, PageSize::Size4K, 0x1000);
    ctx.mappings(untouched).unwrap();

    let mut mode = WriteMode::direct();
    ctx.update_flags(
        PmMemRange::new(a, 0, 0x2000),
        MapFlags::PRIVILEGED,
        MapFlags::empty(),
        &mut mode,
    )
    .unwrap();
    ctx.update_flags(
        PmMemRange::new(b, 0, 0x1_0000),
        MapFlags::READ_ONLY,
        MapFlags::empty(),
        &mut mode,
    )
    .unwrap();
    ctx.device().clear_tlb_invalidations();

    let report = ctx.end_test().unwrap();
    assert_eq!(report.restored.len(), 2);
    assert!(report.restored.contains(&a) && report.restored.contains(&b));
    assert_eq!(report.invalidated, [vs]);
    assert_eq!(ctx.device().tlb_invalidations(), [vs]);
    assert_eq!(report.released, 0);
}

#[test]
fn a_failed_restore_still_invalidates_and_can_be_retried() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let other_vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (_, a) = add(&mut ctx, vs, PageSize::Size4K, 0x2000);
    let (b_buf, b) = add(&mut ctx, other_vs, PageSize::Size4K, 0x2000);

    let mut mode = WriteMode::direct();
    for id in [a, b] {
        ctx.update_flags(
            PmMemRange::new(id, 0, 0x2000),
            MapFlags::READ_ONLY,
            MapFlags::empty(),
            &mut mode,
        )
        .unwrap();
    }
    ctx.device().clear_tlb_invalidations();

    let table = ctx
        .device()
        .table(other_vs, MmuLevelIndex::PteSmall, b_buf.virt_base())
        .unwrap();
    ctx.device().fail_writes(Some((Aperture::Video, table..table + 0x1000)));
    let err = ctx.end_test().unwrap_err();
    assert!(matches!(
        err,
        PmError::Mmu(MmuError::Driver(DriverError::InvalidAddress { .. }))
            | PmError::Driver(DriverError::InvalidAddress { .. })
    ));
    // The surface restored before the failure still gets its invalidation.
    assert!(!ctx.surface(a).unwrap().diverged());
    assert!(ctx.device().tlb_invalidations().contains(&vs));
    let a_base = ctx.surface(a).unwrap().buffer().virt_base();
    assert!(!ctx.device().walk(vs, a_base).unwrap().unwrap().entry.read_only);
    assert!(ctx.surface(b).unwrap().diverged());

    ctx.device().fail_writes(None);
    ctx.device().clear_tlb_invalidations();
    let report = ctx.end_test().unwrap();
    assert_eq!(report.restored, [b]);
    assert_eq!(report.invalidated, [other_vs]);
    assert!(!ctx.device().walk(other_vs, b_buf.virt_base()).unwrap().unwrap().entry.read_only);
}

#[test]
fn freed_backing_is_explored_again() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (_, id) = add(&mut ctx, vs, PageSize::Size4K, 0x2000);
    ctx.mappings(id).unwrap();
    assert_eq!(ctx.trees().len(), 1);

    assert_eq!(ctx.free_backing(id).unwrap(), 1);
    assert!(ctx.trees().is_empty());
    assert_eq!(ctx.surface(id).unwrap().ref_count().refs(), 1);
    assert!(ctx.surface(id).unwrap().kind().is_none());

    assert_eq!(ctx.mappings(id).unwrap().len(), 1);
    assert_eq!(ctx.trees().len(), 1);
}

#[test]
fn unbacked_buffers_cannot_be_explored() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let buf = ctx
        .device()
        .alloc_unbacked(vs, Location::Fb, 0x1000, PageSize::Size4K)
        .unwrap();
    let id = ctx.add_surface(buf.boxed());
    assert_eq!(ctx.mappings(id).unwrap_err(), PmError::NotAllocated);
    assert!(ctx.release(id).unwrap());
}

#[test]
fn io_checks_lengths_and_bounds() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (_, id) = add(&mut ctx, vs, PageSize::Size4K, 0x1000);
    let mut buf = [0u8; 8];
    assert!(matches!(
        ctx.read_virt(PmMemRange::new(id, 0, 4), &mut buf),
        Err(PmError::InvalidArgument(_))
    ));
    assert!(matches!(
        ctx.read_phys_original(PmMemRange::new(id, 0xffc, 8), &mut buf),
        Err(PmError::InvalidArgument(_))
    ));
    ctx.write_virt(PmMemRange::new(id, 0xff8, 8), &[7; 8]).unwrap();
    ctx.read_phys_original(PmMemRange::new(id, 0xff8, 8), &mut buf)
        .unwrap();
    assert_eq!(buf, [7; 8]);
}

#[test]
fn unmapped_pages_cannot_be_read_through() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (_, id) = add(&mut ctx, vs, PageSize::Size4K, 0x2000);
    ctx.update_flags(
        PmMemRange::new(id, 0x1000, 0x1000),
        MapFlags::empty(),
        MapFlags::VALID,
        &mut WriteMode::direct(),
    )
    .unwrap();

    let mut buf = [0u8; 4];
    ctx.read_virt(PmMemRange::new(id, 0xffc, 4), &mut buf).unwrap();
    assert_eq!(
        ctx.read_virt(PmMemRange::new(id, 0x1000, 4), &mut buf),
        Err(PmError::InvalidArgument("virtual page is not mapped"))
    );
}

#[test]
fn legacy_drivers_are_explored_per_pde() {
    let gpu = SimGpu::new(&MmuFormat::V2);
    gpu.set_legacy_only(true);
    let mut ctx = context(gpu, PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let (buf, id) = add(&mut ctx, vs, PageSize::Size64K, 0x2_0000);

    ctx.update_flags(
        PmMemRange::new(id, 0, 0x1_0000),
        MapFlags::READ_ONLY,
        MapFlags::empty(),
        &mut WriteMode::direct(),
    )
    .unwrap();
    assert!(ctx.device().walk(vs, buf.virt_base()).unwrap().unwrap().entry.read_only);

    let key = ctx.surface(id).unwrap().tree_key(ctx.device());
    let tree = ctx.trees().get(&key).unwrap();
    assert_eq!(tree.query_path(), Some(QueryPath::LegacyPdeInfo));
}

#[test]
fn smmu_surfaces_are_edited_per_page() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V2), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Smmu).unwrap();
    let (_, id) = add(&mut ctx, vs, PageSize::Size4K, 0x3000);

    let current = ctx.mappings(id).unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current.mappings()[0].kind(), MappingKind::Smmu);
    assert!(ctx.trees().is_empty());

    let middle = PmMemRange::new(id, 0x1000, 0x1000);
    ctx.update_flags(middle, MapFlags::READ_ONLY, MapFlags::empty(), &mut WriteMode::direct())
        .unwrap();
    let current = ctx.mappings(id).unwrap();
    assert_eq!(current.len(), 3);
    let flags = current.mappings()[1].attrs().to_flags().unwrap();
    assert!(flags.contains(MapFlags::VALID | MapFlags::READ_ONLY));
    assert_eq!(ctx.device().tlb_invalidations(), [vs]);

    assert!(matches!(
        ctx.change_page_size(middle, PageSize::Size64K, &mut WriteMode::direct()),
        Err(PmError::Unsupported(_))
    ));

    let report = ctx.end_test().unwrap();
    assert_eq!(report.restored, [id]);
    assert_eq!(ctx.mappings(id).unwrap().len(), 1);
}

#[test]
fn ats_surfaces_have_nothing_to_rewrite() {
    let mut ctx = context(SimGpu::new(&MmuFormat::V3), PmConfig::default());
    let vs = ctx.device().create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let buf = ctx
        .device()
        .alloc_ats(vs, Location::Coherent, 0x2000, PageSize::Size4K)
        .unwrap();
    let id = ctx.add_surface(buf.boxed());
    let range = PmMemRange::new(id, 0, 0x2000);

    let current = ctx.mappings(id).unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current.mappings()[0].kind(), MappingKind::Ats);
    assert!(current.mappings()[0].attrs().to_flags().is_err());

    ctx.update_flags(range, MapFlags::READ_ONLY, MapFlags::empty(), &mut WriteMode::direct())
        .unwrap();
    let report = ctx
        .move_phys_mem(
            range,
            &MoveOptions::new(DisposalPolicy::KeepAlive),
            &mut WriteMode::direct(),
        )
        .unwrap();
    assert!(report.donors.is_empty());
    assert!(!ctx.surface(id).unwrap().diverged());

    ctx.write_virt(range, &[0x5a; 0x2000]).unwrap();
    let mut back = [0u8; 0x10];
    ctx.read_phys_original(PmMemRange::new(id, 0x1ff0, 0x10), &mut back)
        .unwrap();
    assert_eq!(back, [0x5a; 0x10]);
}
