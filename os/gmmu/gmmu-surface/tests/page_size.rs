use gmmu_addresses::{Location, PageSize, VaSpaceHandle};
use gmmu_format::{EntryRole, GmmuEntryBits, MmuFormat, MmuLevelIndex, MmuVersion};
use gmmu_sim::{SimBuffer, SimGpu, init_test_logging};
use gmmu_surface::{Buffer, MapFlags, PmConfig, PmContext, PmError, PmMemRange, SurfaceId};
use gmmu_tree::{VaSpaceKind, WriteMode};

fn context(
    format: &'static MmuFormat,
    config: PmConfig,
    page_size: PageSize,
    size: u64,
) -> (PmContext<SimGpu>, VaSpaceHandle, SimBuffer, SurfaceId) {
    init_test_logging();
    let gpu = SimGpu::new(format);
    let vs = gpu.create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let buf = gpu.alloc(vs, Location::Fb, size, page_size).unwrap();
    let mut ctx = PmContext::new(gpu, config);
    let id = ctx.add_surface(buf.boxed());
    (ctx, vs, buf, id)
}

fn pattern(len: u64) -> Vec<u8> {
    (0..=250u8).cycle().take(usize::try_from(len).unwrap()).collect()
}

#[test]
fn huge_page_becomes_big_pages_and_comes_back() {
    let size = PageSize::Size2M.bytes();
    let (mut ctx, vs, buf, id) =
        context(&MmuFormat::V3, PmConfig::default(), PageSize::Size2M, size);
    let whole = PmMemRange::new(id, 0, size);
    let before = ctx.mappings(id).unwrap().mappings()[0].attrs().to_flags().unwrap();

    ctx.change_page_size(whole, PageSize::Size64K, &mut WriteMode::direct())
        .unwrap();

    let current = ctx.mappings(id).unwrap();
    assert_eq!(current.len(), 1);
    let mapping = &current.mappings()[0];
    assert_eq!(mapping.page_size(), PageSize::Size64K);
    assert_eq!(mapping.backing().phys, buf.phys_addr(0));
    assert_eq!(mapping.attrs().to_flags().unwrap(), before);

    // The PDE0 slot now points at the big-page table only.
    let (lo, hi) = ctx.device().pde0_slot(vs, buf.virt_base()).unwrap().unwrap();
    let big = GmmuEntryBits::decode(MmuVersion::V3, EntryRole::Pde, lo).unwrap();
    assert!(big.valid);
    assert_eq!(Some(big.address), ctx.device().table(vs, MmuLevelIndex::PteBig, buf.virt_base()));
    assert!(!GmmuEntryBits::decode(MmuVersion::V3, EntryRole::Pde, hi).unwrap().valid);

    let t = ctx.device().walk(vs, buf.virt_base() + 0x1_2345).unwrap().unwrap();
    assert_eq!(t.page_size, PageSize::Size64K);
    assert_eq!(t.address, buf.phys_addr(0x1_2345));
    assert!(ctx.surface(id).unwrap().diverged());

    let report = ctx.end_test().unwrap();
    assert_eq!(report.restored, [id]);
    assert_eq!(report.invalidated, [vs]);
    let t = ctx.device().walk(vs, buf.virt_base() + 0x1_2345).unwrap().unwrap();
    assert_eq!(t.page_size, PageSize::Size2M);
    assert_eq!(t.address, buf.phys_addr(0x1_2345));
    assert!(!ctx.surface(id).unwrap().diverged());
}

#[test]
fn data_survives_a_switch_to_small_pages() {
    let size = PageSize::Size2M.bytes();
    let (mut ctx, vs, buf, id) =
        context(&MmuFormat::V2, PmConfig::default(), PageSize::Size64K, size);
    let head = PmMemRange::new(id, 0, 0x2_0000);
    let data = pattern(head.size);
    ctx.write_virt(head, &data).unwrap();

    ctx.change_page_size(PmMemRange::new(id, 0, size), PageSize::Size4K, &mut WriteMode::direct())
        .unwrap();

    let t = ctx.device().walk(vs, buf.virt_base() + 0x1_0008).unwrap().unwrap();
    assert_eq!(t.page_size, PageSize::Size4K);
    assert_eq!(t.address, buf.phys_addr(0x1_0008));
    let mut back = vec![0; data.len()];
    ctx.read_virt(head, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn dual_page_size_restore_clears_the_small_pages() {
    let size = PageSize::Size2M.bytes();
    let config = PmConfig::default().with_dual_page_size(true);
    let (mut ctx, vs, buf, id) = context(&MmuFormat::V2, config, PageSize::Size64K, size);

    ctx.change_page_size(PmMemRange::new(id, 0, size), PageSize::Size4K, &mut WriteMode::direct())
        .unwrap();
    let t = ctx.device().walk(vs, buf.virt_base() + 0x3000).unwrap().unwrap();
    assert_eq!(t.page_size, PageSize::Size4K);

    ctx.end_test().unwrap();
    let t = ctx.device().walk(vs, buf.virt_base() + 0x3000).unwrap().unwrap();
    assert_eq!(t.page_size, PageSize::Size64K);
    assert_eq!(t.address, buf.phys_addr(0x3000));
}

#[test]
fn two_step_transitions_are_refused() {
    let size = PageSize::Size512M.bytes();
    let (mut ctx, _, _, id) =
        context(&MmuFormat::V3, PmConfig::default(), PageSize::Size512M, size);
    let err = ctx
        .change_page_size(PmMemRange::new(id, 0, size), PageSize::Size4K, &mut WriteMode::direct())
        .unwrap_err();
    assert_eq!(
        err,
        PmError::PageSizeTransition {
            from: PageSize::Size512M,
            to: PageSize::Size4K
        }
    );
    assert!(!ctx.surface(id).unwrap().diverged());
}

#[test]
fn flag_updates_split_and_rejoin() {
    let (mut ctx, vs, buf, id) =
        context(&MmuFormat::V2, PmConfig::default(), PageSize::Size64K, 0x4_0000);
    let middle = PmMemRange::new(id, 0x1_0000, 0x1_0000);

    ctx.update_flags(middle, MapFlags::READ_ONLY, MapFlags::empty(), &mut WriteMode::direct())
        .unwrap();
    assert_eq!(ctx.mappings(id).unwrap().len(), 3);
    assert!(ctx.device().walk(vs, buf.virt_base() + 0x1_0000).unwrap().unwrap().entry.read_only);
    assert!(!ctx.device().walk(vs, buf.virt_base() + 0x2_0000).unwrap().unwrap().entry.read_only);
    assert!(!ctx.device().tlb_invalidations().is_empty());

    ctx.update_flags(middle, MapFlags::empty(), MapFlags::READ_ONLY, &mut WriteMode::direct())
        .unwrap();
    assert_eq!(ctx.mappings(id).unwrap().len(), 1);
    assert!(!ctx.surface(id).unwrap().diverged());
}

#[test]
fn a_flag_cannot_be_set_and_cleared() {
    let (mut ctx, _, _, id) =
        context(&MmuFormat::V2, PmConfig::default(), PageSize::Size4K, 0x2000);
    let err = ctx
        .update_flags(
            PmMemRange::new(id, 0, 0x2000),
            MapFlags::READ_ONLY,
            MapFlags::READ_ONLY,
            &mut WriteMode::direct(),
        )
        .unwrap_err();
    assert!(matches!(err, PmError::BadParameter(_)));
}

#[test]
fn deferred_configuration_batches_invalidation() {
    let config = PmConfig::default().with_defer_tlb_invalidate(true);
    let (mut ctx, vs, _, id) = context(&MmuFormat::V2, config, PageSize::Size4K, 0x2000);
    let mut mode = ctx.write_mode();
    ctx.update_flags(
        PmMemRange::new(id, 0, 0x1000),
        MapFlags::PRIVILEGED,
        MapFlags::empty(),
        &mut mode,
    )
    .unwrap();
    assert!(mode.invalidate_pending);
    assert!(ctx.device().tlb_invalidations().is_empty());

    ctx.invalidate_tlb(vs).unwrap();
    assert_eq!(ctx.device().tlb_invalidations(), [vs]);
}
