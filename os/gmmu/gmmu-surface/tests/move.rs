use gmmu_addresses::{Aperture, Location, PageSize, VaSpaceHandle};
use gmmu_format::MmuFormat;
use gmmu_sim::{SimBuffer, SimChannel, SimGpu, init_test_logging};
use gmmu_surface::context::{DUMP_LIMIT, SCRAMBLE_PATTERN};
use gmmu_surface::{
    Buffer, DisposalPolicy, MoveOptions, PmConfig, PmContext, PmError, PmMemRange, SurfaceId,
};
use gmmu_tree::{VaSpaceKind, WriteMode};

struct Run {
    ctx: PmContext<SimGpu>,
    vs: VaSpaceHandle,
    buf: SimBuffer,
    id: SurfaceId,
}

fn run(gpu: SimGpu, page_size: PageSize, size: u64) -> Run {
    init_test_logging();
    let vs = gpu.create_vaspace(VaSpaceKind::Gmmu).unwrap();
    let buf = gpu.alloc(vs, Location::Fb, size, page_size).unwrap();
    let mut ctx = PmContext::new(gpu, PmConfig::default());
    let id = ctx.add_surface(buf.boxed());
    Run { ctx, vs, buf, id }
}

fn pattern(len: u64) -> Vec<u8> {
    (0..=250u8).cycle().take(usize::try_from(len).unwrap()).collect()
}

fn whole(r: &Run) -> PmMemRange {
    PmMemRange::new(r.id, 0, r.buf.size())
}

#[test]
fn scrambled_moves_keep_the_data_visible() {
    let mut r = run(SimGpu::with_subdevices(&MmuFormat::V2, 2), PageSize::Size64K, 0x2_0000);
    let range = whole(&r);
    let data = pattern(range.size);
    r.ctx.write_virt(range, &data).unwrap();

    let mut mode = r.ctx.write_mode();
    let report = r
        .ctx
        .move_phys_mem(range, &MoveOptions::new(DisposalPolicy::Scramble), &mut mode)
        .unwrap();
    assert_eq!(report.donors.len(), 1);
    let donor_id = report.donors[0];
    let donor = r.ctx.surface(donor_id).unwrap().buffer().phys_addr(0);

    let t = r.ctx.device().walk(r.vs, r.buf.virt_base() + 0x1_0010).unwrap().unwrap();
    assert_eq!(t.address, donor + 0x1_0010);
    assert_eq!(r.ctx.mappings(r.id).unwrap().mappings()[0].backing().phys, donor);

    let mut back = vec![0; data.len()];
    r.ctx.read_virt(range, &mut back).unwrap();
    assert_eq!(back, data);

    let mut old = [0u8; 8];
    r.ctx
        .read_phys_original(PmMemRange::new(r.id, 0x40, 8), &mut old)
        .unwrap();
    assert_eq!(old[..4], SCRAMBLE_PATTERN.to_le_bytes());
    let word = (u64::from(SCRAMBLE_PATTERN) << 32) | u64::from(SCRAMBLE_PATTERN);
    for subdevice in 0..2 {
        let raw = r
            .ctx
            .device()
            .read_u64(subdevice, Aperture::Video, r.buf.phys_addr(0x1_fff8))
            .unwrap();
        assert_eq!(raw, word);
    }

    let report = r.ctx.end_test().unwrap();
    assert_eq!(report.restored, [r.id]);
    assert_eq!(report.released, 1);
    assert_eq!(r.ctx.surface(donor_id).unwrap_err(), PmError::NoSuchSurface(donor_id));
    let t = r.ctx.device().walk(r.vs, r.buf.virt_base()).unwrap().unwrap();
    assert_eq!(t.address, r.buf.phys_addr(0));
}

#[test]
fn scrambling_is_refused_in_band() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size4K, 0x2000);
    let range = whole(&r);
    let mut channel = SimChannel::new();
    let err = r
        .ctx
        .move_phys_mem(
            range,
            &MoveOptions::new(DisposalPolicy::Scramble),
            &mut WriteMode::in_band(&mut channel),
        )
        .unwrap_err();
    assert!(matches!(err, PmError::SoftwareError(_)));
    assert_eq!(channel.pending(), 0);
}

#[test]
fn checksums_cover_the_abandoned_memory() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size64K, 0x1_0000);
    let range = whole(&r);
    let words: Vec<u8> = (1..=0x4000u32).flat_map(u32::to_le_bytes).collect();
    r.ctx.write_virt(range, &words).unwrap();

    let report = r
        .ctx
        .move_phys_mem(range, &MoveOptions::new(DisposalPolicy::Checksum), &mut WriteMode::direct())
        .unwrap();
    let expected = (1..=0x4000u32).fold(0u32, u32::wrapping_add);
    assert_eq!(report.checksums, [(range, expected)]);
}

#[test]
fn dumps_are_capped() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size4K, 0x3000);
    let range = whole(&r);
    let data = pattern(range.size);
    r.ctx.write_virt(range, &data).unwrap();

    let report = r
        .ctx
        .move_phys_mem(range, &MoveOptions::new(DisposalPolicy::Dump), &mut WriteMode::direct())
        .unwrap();
    assert_eq!(report.dumps.len(), 1);
    let (dumped, bytes) = &report.dumps[0];
    assert_eq!(*dumped, range);
    assert_eq!(bytes.len(), DUMP_LIMIT);
    assert_eq!(bytes[..], data[..DUMP_LIMIT]);
}

#[test]
fn kept_alive_memory_is_held_until_the_test_ends() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size4K, 0x2000);
    let range = PmMemRange::new(r.id, 0x1000, 0x1000);
    let options = MoveOptions::new(r.ctx.config().default_disposal);
    let mut mode = r.ctx.write_mode();
    r.ctx
        .move_phys_mem(range, &options, &mut mode)
        .unwrap();

    let kept = r.ctx.surface(r.id).unwrap().kept_alive();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].range, range);
    assert_eq!(kept[0].backing.phys, r.buf.phys_addr(0x1000));
    assert_eq!(r.ctx.mappings(r.id).unwrap().len(), 2);

    r.ctx.end_test().unwrap();
    assert!(r.ctx.surface(r.id).unwrap().kept_alive().is_empty());
    assert_eq!(r.ctx.mappings(r.id).unwrap().len(), 1);
}

#[test]
fn in_band_moves_land_when_the_channel_drains() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size64K, 0x2_0000);
    let range = whole(&r);
    let data = pattern(range.size);
    r.ctx.write_virt(range, &data).unwrap();

    let mut channel = SimChannel::new();
    let report = {
        let mut mode = WriteMode::in_band(&mut channel);
        let report = r
            .ctx
            .move_phys_mem(range, &MoveOptions::new(DisposalPolicy::KeepAlive), &mut mode)
            .unwrap();
        assert!(mode.invalidate_pending);
        report
    };
    let donor = r.ctx.surface(report.donors[0]).unwrap().buffer().phys_addr(0);
    let t = r.ctx.device().walk(r.vs, r.buf.virt_base()).unwrap().unwrap();
    assert_eq!(t.address, r.buf.phys_addr(0));

    assert!(channel.drain(r.ctx.device()).unwrap() > 0);
    r.ctx.invalidate_tlb(r.vs).unwrap();
    let t = r.ctx.device().walk(r.vs, r.buf.virt_base() + 0x1_0000).unwrap().unwrap();
    assert_eq!(t.address, donor + 0x1_0000);
    let mut back = vec![0; data.len()];
    r.ctx.read_virt(range, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn explicit_donors_must_fit() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size4K, 0x4000);
    let other = r
        .ctx
        .device()
        .alloc(r.vs, Location::Fb, 0x2000, PageSize::Size4K)
        .unwrap();
    let other_id = r.ctx.add_surface(other.boxed());
    let head = PmMemRange::new(r.id, 0, 0x2000);
    let mut mode = WriteMode::direct();

    let donor = |range| MoveOptions::new(DisposalPolicy::KeepAlive).with_donor(Some(range));

    let overlapping = donor(PmMemRange::new(r.id, 0x1000, 0x2000));
    assert!(matches!(
        r.ctx.move_phys_mem(head, &overlapping, &mut mode),
        Err(PmError::InvalidArgument(_))
    ));
    let short = donor(PmMemRange::new(other_id, 0, 0x1000));
    assert!(matches!(
        r.ctx.move_phys_mem(head, &short, &mut mode),
        Err(PmError::InvalidArgument(_))
    ));

    let fitting = donor(PmMemRange::new(other_id, 0, 0x2000));
    let report = r.ctx.move_phys_mem(head, &fitting, &mut mode).unwrap();
    assert!(report.donors.is_empty());
    let t = r.ctx.device().walk(r.vs, r.buf.virt_base() + 0x1000).unwrap().unwrap();
    assert_eq!(t.address, other.phys_addr(0x1000));
}

#[test]
fn aliases_share_physical_memory() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size4K, 0x2000);
    let src_buf = r
        .ctx
        .device()
        .alloc(r.vs, Location::Fb, 0x2000, PageSize::Size4K)
        .unwrap();
    let src_id = r.ctx.add_surface(src_buf.boxed());
    let dst = whole(&r);
    let src = PmMemRange::new(src_id, 0, 0x2000);

    assert!(matches!(
        r.ctx.alias_phys_mem(dst, PmMemRange::new(src_id, 0, 0x1000), &mut WriteMode::direct()),
        Err(PmError::InvalidArgument(_))
    ));
    r.ctx.alias_phys_mem(dst, src, &mut WriteMode::direct()).unwrap();

    let data = pattern(0x2000);
    r.ctx.write_virt(src, &data).unwrap();
    let mut back = vec![0; data.len()];
    r.ctx.read_virt(dst, &mut back).unwrap();
    assert_eq!(back, data);
    assert!(r.ctx.surface(r.id).unwrap().diverged());
    assert!(!r.ctx.surface(src_id).unwrap().diverged());
}

#[test]
fn aliasing_lowers_the_page_size_to_the_source() {
    let mut r = run(SimGpu::new(&MmuFormat::V2), PageSize::Size64K, PageSize::Size2M.bytes());
    let src_buf = r
        .ctx
        .device()
        .alloc(r.vs, Location::Fb, 0x2_0000, PageSize::Size4K)
        .unwrap();
    let src_id = r.ctx.add_surface(src_buf.boxed());
    let dst = PmMemRange::new(r.id, 0, 0x2_0000);

    r.ctx
        .alias_phys_mem(dst, PmMemRange::new(src_id, 0, 0x2_0000), &mut WriteMode::direct())
        .unwrap();
    let t = r.ctx.device().walk(r.vs, r.buf.virt_base() + 0x1_1000).unwrap().unwrap();
    assert_eq!(t.page_size, PageSize::Size4K);
    assert_eq!(t.address, src_buf.phys_addr(0x1_1000));
    assert!(r.ctx.mappings(r.id).unwrap().mappings()[0].page_size() == PageSize::Size4K);
}
