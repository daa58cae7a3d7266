//! # Software GPU
//!
//! A [`SimGpu`] stands in for a device and its driver in tests of the
//! page-table mirror. It keeps sparse physical memory per subdevice, builds
//! real page tables with the entry codec of its [`MmuFormat`] and answers
//! every [`GmmuDriver`] call from that state.
//!
//! ```text
//!  SimGpu ── RefCell<SimState>
//!     │        ├── memory: one sparse frame map per subdevice
//!     │        ├── regions: backed physical ranges per aperture
//!     │        └── vaspaces: root, tables by (level, VA), SMMU PTEs
//!     │
//!     ├── GmmuDriver: layout queries, phys access, PTE access, TLB log
//!     └── PmDevice:   alloc_buffer → SimBuffer
//!
//!  SimChannel ── recorded copy-engine methods, executed by drain()
//! ```
//!
//! ## Table layout
//! Every 2 MiB region mapped with 4K or 64K pages gets both leaf tables; the
//! PDE0 slot connects only the half in use. Regions mapped with 2 MiB leaves
//! keep both tables allocated but unconnected, so the mirror can switch page
//! sizes without allocating.
//!
//! [`SimGpu::walk`] translates a virtual address the way hardware would,
//! reading the tables back from memory. Tests use it to check what the
//! mirror wrote.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Once;

use gmmu_addresses::{
    Aperture, DeviceId, GpuVirtualAddress, Location, MemHandle, PageSize, PhysicalAddress,
    VaSpaceHandle, align_down, align_up, is_aligned,
};
use gmmu_format::{EntryRole, GmmuEntryBits, LevelDesc, MmuFormat, MmuLevelIndex, entry};
use gmmu_surface::{Buffer, BufferDesc, PmDevice};
use gmmu_tree::channel::{CeDecoder, CeOp};
use gmmu_tree::driver::{
    InvalidateTlbParams, PageLevelDesc, PageLevelInfo, PageLevelInfoParams, PdeInfoParams, PteInfo,
    PteInfoParams, SetPteInfoParams,
};
use gmmu_tree::{CommandChannel, DriverError, GmmuDriver, VaSpaceKind};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Granule of the sparse memory model.
const FRAME: u64 = 0x1000;

const FB_BASE: u64 = 0x0100_0000;
const SYS_BASE: u64 = 0x1_0000_0000;
const VA_BASE: u64 = 0x20_0000_0000;

/// Aperture page tables live in.
const TABLE_APERTURE: Aperture = Aperture::Video;

#[allow(clippy::cast_possible_truncation)]
const fn to_usize(v: u64) -> usize {
    v as usize
}

/// A hardware walk result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SimTranslation {
    pub page_size: PageSize,
    /// The leaf entry, decoded.
    pub entry: GmmuEntryBits,
    /// Physical address of the translated byte.
    pub address: PhysicalAddress,
}

struct SimVaSpace {
    kind: VaSpaceKind,
    /// Tables by level and the VA their first entry translates.
    tables: BTreeMap<(MmuLevelIndex, u64), PhysicalAddress>,
    /// SMMU PTEs by page VA.
    smmu: BTreeMap<u64, PteInfo>,
    next_va: u64,
}

struct SimState {
    memory: Vec<BTreeMap<(Aperture, u64), Box<[u8]>>>,
    regions: Vec<(Aperture, Range<u64>)>,
    next_fb: u64,
    next_sys: u64,
    next_mem: u32,
    next_vaspace: u32,
    vaspaces: BTreeMap<VaSpaceHandle, SimVaSpace>,
    tlb_log: Vec<VaSpaceHandle>,
    legacy_only: bool,
    /// Driver writes overlapping this region fail.
    write_fault: Option<(Aperture, Range<u64>)>,
}

impl SimState {
    fn is_backed(&self, aperture: Aperture, address: u64, len: u64) -> bool {
        let end = address + len;
        self.regions
            .iter()
            .any(|(a, r)| *a == aperture && r.start <= address && end <= r.end)
    }

    fn check_access(
        &self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
        len: usize,
    ) -> Result<(), DriverError> {
        if subdevice as usize >= self.memory.len() {
            return Err(DriverError::InvalidArgument("no such subdevice"));
        }
        if len > 0 && !self.is_backed(aperture, address.as_u64(), len as u64) {
            return Err(DriverError::InvalidAddress { aperture, address });
        }
        Ok(())
    }

    fn read(
        &self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
        buf: &mut [u8],
    ) -> Result<(), DriverError> {
        self.check_access(subdevice, aperture, address, buf.len())?;
        let memory = &self.memory[subdevice as usize];
        let mut done = 0;
        while done < buf.len() {
            let at = address.as_u64() + done as u64;
            let within = to_usize(at % FRAME);
            let n = (to_usize(FRAME) - within).min(buf.len() - done);
            match memory.get(&(aperture, at / FRAME)) {
                Some(frame) => buf[done..done + n].copy_from_slice(&frame[within..within + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write(
        &mut self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
        data: &[u8],
    ) -> Result<(), DriverError> {
        self.check_access(subdevice, aperture, address, data.len())?;
        let memory = &mut self.memory[subdevice as usize];
        let mut done = 0;
        while done < data.len() {
            let at = address.as_u64() + done as u64;
            let within = to_usize(at % FRAME);
            let n = (to_usize(FRAME) - within).min(data.len() - done);
            let frame = memory
                .entry((aperture, at / FRAME))
                .or_insert_with(|| vec![0u8; to_usize(FRAME)].into_boxed_slice());
            frame[within..within + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn broadcast(
        &mut self,
        aperture: Aperture,
        address: PhysicalAddress,
        data: &[u8],
    ) -> Result<(), DriverError> {
        for subdevice in 0..self.memory.len() {
            self.write(u32::try_from(subdevice).unwrap_or(u32::MAX), aperture, address, data)?;
        }
        Ok(())
    }

    fn read_u64(&self, aperture: Aperture, address: PhysicalAddress) -> Result<u64, DriverError> {
        let mut raw = [0u8; 8];
        self.read(0, aperture, address, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    fn write_u64(
        &mut self,
        aperture: Aperture,
        address: PhysicalAddress,
        value: u64,
    ) -> Result<(), DriverError> {
        self.broadcast(aperture, address, &value.to_le_bytes())
    }

    fn alloc_phys(
        &mut self,
        aperture: Aperture,
        size: u64,
        align: u64,
    ) -> Result<PhysicalAddress, DriverError> {
        let next = match aperture {
            Aperture::Video => &mut self.next_fb,
            Aperture::SysCoherent | Aperture::SysNonCoherent => &mut self.next_sys,
            Aperture::Peer | Aperture::Invalid => {
                return Err(DriverError::InvalidArgument("aperture not allocatable"));
            }
        };
        let base = align_up(*next, align.max(FRAME));
        let end = base.checked_add(size).ok_or(DriverError::OutOfMemory)?;
        *next = end;
        self.regions.push((aperture, base..end));
        log::trace!("sim: {size:#x} bytes of {aperture:?} at {base:#x}");
        Ok(PhysicalAddress::new(base))
    }

    fn vaspace(&self, handle: VaSpaceHandle) -> Result<&SimVaSpace, DriverError> {
        self.vaspaces.get(&handle).ok_or(DriverError::NoSuchVaSpace(handle))
    }

    fn vaspace_mut(&mut self, handle: VaSpaceHandle) -> Result<&mut SimVaSpace, DriverError> {
        self.vaspaces.get_mut(&handle).ok_or(DriverError::NoSuchVaSpace(handle))
    }

    fn table_of(
        &self,
        handle: VaSpaceHandle,
        desc: &LevelDesc,
        va: u64,
    ) -> Option<PhysicalAddress> {
        self.vaspaces
            .get(&handle)?
            .tables
            .get(&(desc.index, align_down(va, desc.table_span())))
            .copied()
    }

    /// The table of `desc` covering `va`, allocated (zeroed) if missing.
    fn ensure_table(
        &mut self,
        handle: VaSpaceHandle,
        desc: &LevelDesc,
        va: u64,
    ) -> Result<PhysicalAddress, DriverError> {
        if let Some(table) = self.table_of(handle, desc, va) {
            return Ok(table);
        }
        let size = align_up(desc.table_bytes(), FRAME);
        let table = self.alloc_phys(TABLE_APERTURE, size, FRAME)?;
        let key = (desc.index, align_down(va, desc.table_span()));
        self.vaspace_mut(handle)?.tables.insert(key, table);
        log::trace!("sim: {:?} table for {:#x} at {table:?}", desc.index, key.1);
        Ok(table)
    }
}

/// A simulated device with its driver.
pub struct SimGpu {
    device: DeviceId,
    format: &'static MmuFormat,
    state: RefCell<SimState>,
}

impl SimGpu {
    /// A single-subdevice GPU.
    #[must_use]
    pub fn new(format: &'static MmuFormat) -> Self {
        Self::with_subdevices(format, 1)
    }

    /// A GPU whose page tables are shared by `subdevices` subdevices, each
    /// with its own copy of memory.
    #[must_use]
    pub fn with_subdevices(format: &'static MmuFormat, subdevices: u32) -> Self {
        Self {
            device: DeviceId(0),
            format,
            state: RefCell::new(SimState {
                memory: (0..subdevices.max(1)).map(|_| BTreeMap::new()).collect(),
                regions: Vec::new(),
                next_fb: FB_BASE,
                next_sys: SYS_BASE,
                next_mem: 1,
                next_vaspace: 1,
                vaspaces: BTreeMap::new(),
                tlb_log: Vec::new(),
                legacy_only: false,
                write_fault: None,
            }),
        }
    }

    /// Answer [`get_page_level_info`](GmmuDriver::get_page_level_info) with
    /// "not supported", like drivers predating it.
    pub fn set_legacy_only(&self, legacy_only: bool) {
        self.state.borrow_mut().legacy_only = legacy_only;
    }

    /// Make [`write_phys`](GmmuDriver::write_phys) fail for writes touching
    /// `region`, or stop failing with `None`.
    pub fn fail_writes(&self, region: Option<(Aperture, Range<PhysicalAddress>)>) {
        self.state.borrow_mut().write_fault =
            region.map(|(a, r)| (a, r.start.as_u64()..r.end.as_u64()));
    }

    /// Address spaces invalidated so far, in call order.
    #[must_use]
    pub fn tlb_invalidations(&self) -> Vec<VaSpaceHandle> {
        self.state.borrow().tlb_log.clone()
    }

    pub fn clear_tlb_invalidations(&self) {
        self.state.borrow_mut().tlb_log.clear();
    }

    /// A new address space. GMMU spaces get their root table right away.
    ///
    /// # Errors
    /// [`DriverError::OutOfMemory`] if the root table cannot be placed.
    pub fn create_vaspace(&self, kind: VaSpaceKind) -> Result<VaSpaceHandle, DriverError> {
        let mut state = self.state.borrow_mut();
        let handle = VaSpaceHandle(state.next_vaspace);
        state.next_vaspace += 1;
        state.vaspaces.insert(
            handle,
            SimVaSpace {
                kind,
                tables: BTreeMap::new(),
                smmu: BTreeMap::new(),
                next_va: VA_BASE,
            },
        );
        if kind == VaSpaceKind::Gmmu {
            let root = &self.format.levels[0];
            state.ensure_table(handle, root, 0)?;
        }
        log::debug!("sim: created {kind:?} address space {handle:?}");
        Ok(handle)
    }

    /// Backed physical memory, not mapped anywhere.
    ///
    /// # Errors
    /// [`DriverError::InvalidArgument`] for peer memory.
    pub fn alloc_phys(
        &self,
        location: Location,
        size: u64,
        align: u64,
    ) -> Result<PhysicalAddress, DriverError> {
        self.state
            .borrow_mut()
            .alloc_phys(location.aperture(), size, align)
    }

    fn reserve(
        &self,
        vaspace: VaSpaceHandle,
        size: u64,
        page_size: PageSize,
    ) -> Result<(MemHandle, GpuVirtualAddress), DriverError> {
        if size == 0 || !is_aligned(size, page_size.bytes()) {
            return Err(DriverError::InvalidArgument("size is not a multiple of the page size"));
        }
        if self.format.leaf_level(page_size).is_none() {
            return Err(DriverError::InvalidArgument("page size not supported by this format"));
        }
        let mut state = self.state.borrow_mut();
        let align = page_size.bytes().max(PageSize::Size2M.bytes());
        let vs = state.vaspace_mut(vaspace)?;
        let va = align_up(vs.next_va, align);
        vs.next_va = align_up(va + size, align);
        let mem = MemHandle(state.next_mem);
        state.next_mem += 1;
        Ok((mem, GpuVirtualAddress::new(va)))
    }

    /// Allocate physically contiguous memory and map it.
    ///
    /// # Errors
    /// - [`DriverError::InvalidArgument`] for sizes that are not a multiple of
    ///   `page_size` or page sizes the format lacks.
    /// - [`DriverError::NoSuchVaSpace`] for unknown handles.
    pub fn alloc(
        &self,
        vaspace: VaSpaceHandle,
        location: Location,
        size: u64,
        page_size: PageSize,
    ) -> Result<SimBuffer, DriverError> {
        let (mem, va) = self.reserve(vaspace, size, page_size)?;
        let aperture = location.aperture();
        let phys = self.state.borrow_mut().alloc_phys(aperture, size, page_size.bytes())?;
        let kind = self.state.borrow().vaspace(vaspace)?.kind;
        match kind {
            VaSpaceKind::Gmmu => {
                self.map(vaspace, va, size, page_size, GmmuEntryBits::leaf(aperture, phys))?;
            }
            VaSpaceKind::Smmu => {
                let mut state = self.state.borrow_mut();
                let vs = state.vaspace_mut(vaspace)?;
                let mut delta = 0;
                while delta < size {
                    vs.smmu.insert(
                        va.as_u64() + delta,
                        PteInfo {
                            valid: true,
                            aperture,
                            address: phys + delta,
                            ..PteInfo::default()
                        },
                    );
                    delta += page_size.bytes();
                }
            }
        }
        log::debug!(
            "sim: {mem:?} {size:#x} bytes at {va} -> {aperture:?} {phys:?} ({page_size} pages)"
        );
        Ok(SimBuffer {
            size,
            mem,
            location,
            virt_base: va,
            vaspace,
            page_size,
            phys: Some(phys),
            ats: false,
        })
    }

    /// A buffer with a virtual range but no memory yet.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_unbacked(
        &self,
        vaspace: VaSpaceHandle,
        location: Location,
        size: u64,
        page_size: PageSize,
    ) -> Result<SimBuffer, DriverError> {
        let (mem, va) = self.reserve(vaspace, size, page_size)?;
        Ok(SimBuffer {
            size,
            mem,
            location,
            virt_base: va,
            vaspace,
            page_size,
            phys: None,
            ats: false,
        })
    }

    /// Memory reached through ATS: backed, but without page-table entries.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn alloc_ats(
        &self,
        vaspace: VaSpaceHandle,
        location: Location,
        size: u64,
        page_size: PageSize,
    ) -> Result<SimBuffer, DriverError> {
        let (mem, va) = self.reserve(vaspace, size, page_size)?;
        let phys = self
            .state
            .borrow_mut()
            .alloc_phys(location.aperture(), size, page_size.bytes())?;
        Ok(SimBuffer {
            size,
            mem,
            location,
            virt_base: va,
            vaspace,
            page_size,
            phys: Some(phys),
            ats: true,
        })
    }

    /// Map `[va, va + size)` with `page_size` leaves copied from `template`,
    /// the address advancing by one page per entry. Missing tables are
    /// allocated.
    ///
    /// # Errors
    /// - [`DriverError::InvalidArgument`] for unaligned ranges, page sizes the
    ///   format lacks, or templates the format cannot encode.
    /// - [`DriverError::NoSuchVaSpace`] for unknown or SMMU address spaces.
    pub fn map(
        &self,
        vaspace: VaSpaceHandle,
        va: GpuVirtualAddress,
        size: u64,
        page_size: PageSize,
        template: GmmuEntryBits,
    ) -> Result<(), DriverError> {
        let step = page_size.bytes();
        if !va.is_aligned_to(step) || !is_aligned(size, step) {
            return Err(DriverError::InvalidArgument("mapping not aligned to its page size"));
        }
        let leaf = self
            .format
            .leaf_level(page_size)
            .and_then(|i| self.format.level(i))
            .ok_or(DriverError::InvalidArgument("page size not supported by this format"))?;
        let mut state = self.state.borrow_mut();
        if state.vaspace(vaspace)?.kind != VaSpaceKind::Gmmu {
            return Err(DriverError::NoSuchVaSpace(vaspace));
        }

        let mut delta = 0;
        while delta < size {
            let at = va.as_u64() + delta;
            self.connect_directories(&mut state, vaspace, leaf, at)?;
            let mut bits = template;
            bits.address = template.address + delta;
            let table = state
                .table_of(vaspace, leaf, at)
                .ok_or(DriverError::InvalidArgument("leaf table missing"))?;
            let raw = bits
                .encode(self.format.version, EntryRole::Pte)
                .map_err(|_| DriverError::InvalidArgument("entry not encodable"))?;
            let slot =
                table + leaf.index_of(GpuVirtualAddress::new(at)) * u64::from(leaf.entry_size);
            state.write_u64(TABLE_APERTURE, slot, raw)?;
            delta += step;
        }
        Ok(())
    }

    /// Allocate and connect every table above `leaf` for `va`. Below PDE1
    /// both leaf tables are kept, with only the one of `leaf` connected.
    fn connect_directories(
        &self,
        state: &mut SimState,
        vaspace: VaSpaceHandle,
        leaf: &LevelDesc,
        va: u64,
    ) -> Result<(), DriverError> {
        let version = self.format.version;
        let mut parent: Option<&LevelDesc> = None;
        for desc in self.format.levels {
            if desc.index >= MmuLevelIndex::PteBig || desc.index > leaf.index {
                break;
            }
            let table = state.ensure_table(vaspace, desc, va)?;
            if let Some(parent) = parent {
                let parent_table = state
                    .table_of(vaspace, parent, va)
                    .ok_or(DriverError::InvalidArgument("parent table missing"))?;
                let index = parent.index_of(GpuVirtualAddress::new(va));
                let slot = parent_table + index * u64::from(parent.entry_size);
                let raw = encode_pde(version, GmmuEntryBits::table(TABLE_APERTURE, table))?;
                state.write_u64(TABLE_APERTURE, slot, raw)?;
            }
            parent = Some(desc);
        }

        if leaf.index < MmuLevelIndex::Pde0 {
            return Ok(());
        }
        let (Some(pde0), Some(big), Some(small)) = (
            self.format.level(MmuLevelIndex::Pde0),
            self.format.level(MmuLevelIndex::PteBig),
            self.format.level(MmuLevelIndex::PteSmall),
        ) else {
            return Err(DriverError::InvalidArgument("format without PDE0 or leaf tables"));
        };
        let big_table = state.ensure_table(vaspace, big, va)?;
        let small_table = state.ensure_table(vaspace, small, va)?;
        if leaf.index == MmuLevelIndex::Pde0 {
            return Ok(());
        }

        let pde0_table = state
            .table_of(vaspace, pde0, va)
            .ok_or(DriverError::InvalidArgument("PDE0 table missing"))?;
        let slot =
            pde0_table + pde0.index_of(GpuVirtualAddress::new(va)) * u64::from(pde0.entry_size);
        let (lo, hi) = if leaf.index == MmuLevelIndex::PteBig {
            (GmmuEntryBits::table(TABLE_APERTURE, big_table), GmmuEntryBits::default())
        } else {
            (GmmuEntryBits::default(), GmmuEntryBits::table(TABLE_APERTURE, small_table))
        };
        state.write_u64(TABLE_APERTURE, slot, encode_pde(version, lo)?)?;
        state.write_u64(TABLE_APERTURE, slot + 8, encode_pde(version, hi)?)?;
        Ok(())
    }

    /// The table of `level` translating `va`, if allocated.
    #[must_use]
    pub fn table(
        &self,
        vaspace: VaSpaceHandle,
        level: MmuLevelIndex,
        va: GpuVirtualAddress,
    ) -> Option<PhysicalAddress> {
        let desc = self.format.level(level)?;
        self.state.borrow().table_of(vaspace, desc, va.as_u64())
    }

    /// Both halves of the PDE0 slot translating `va`, read from memory.
    ///
    /// # Errors
    /// Undecodable entries.
    pub fn pde0_slot(
        &self,
        vaspace: VaSpaceHandle,
        va: GpuVirtualAddress,
    ) -> Result<Option<(u64, u64)>, DriverError> {
        let Some(desc) = self.format.level(MmuLevelIndex::Pde0) else {
            return Ok(None);
        };
        let state = self.state.borrow();
        let Some(table) = state.table_of(vaspace, desc, va.as_u64()) else {
            return Ok(None);
        };
        let slot = table + desc.index_of(va) * u64::from(desc.entry_size);
        Ok(Some((
            state.read_u64(TABLE_APERTURE, slot)?,
            state.read_u64(TABLE_APERTURE, slot + 8)?,
        )))
    }

    /// Translate `va` as the hardware would, from the tables in memory of
    /// subdevice 0. `None` if the address does not translate.
    ///
    /// # Errors
    /// Unknown address spaces, unbacked tables and undecodable entries.
    pub fn walk(
        &self,
        vaspace: VaSpaceHandle,
        va: GpuVirtualAddress,
    ) -> Result<Option<SimTranslation>, DriverError> {
        let version = self.format.version;
        let state = self.state.borrow();
        let root = &self.format.levels[0];
        let Some(mut table) = state.table_of(vaspace, root, va.as_u64()) else {
            return Err(DriverError::NoSuchVaSpace(vaspace));
        };
        let decode = |role, raw| {
            GmmuEntryBits::decode(version, role, raw)
                .map_err(|_| DriverError::InvalidArgument("undecodable entry"))
        };
        let leaf_at = |state: &SimState,
                       desc: &LevelDesc,
                       table: PhysicalAddress|
         -> Result<Option<SimTranslation>, DriverError> {
            let slot = table + desc.index_of(va) * u64::from(desc.entry_size);
            let raw = state.read_u64(TABLE_APERTURE, slot)?;
            let bits = decode(EntryRole::Pte, raw)?;
            let Some(page_size) = desc.leaf_page_size.filter(|_| bits.valid) else {
                return Ok(None);
            };
            Ok(Some(SimTranslation {
                page_size,
                entry: bits,
                address: bits.address + va.offset(page_size),
            }))
        };

        for desc in self.format.levels {
            let slot = table + desc.index_of(va) * u64::from(desc.entry_size);
            let raw = state.read_u64(TABLE_APERTURE, slot)?;
            if desc.is_dual_purpose() && entry::is_valid_leaf(raw) {
                return leaf_at(&state, desc, table);
            }
            if desc.index == MmuLevelIndex::Pde0 {
                let big = decode(EntryRole::Pde, raw)?;
                let small = decode(EntryRole::Pde, state.read_u64(TABLE_APERTURE, slot + 8)?)?;
                let (Some(big_desc), Some(small_desc)) = (
                    self.format.level(MmuLevelIndex::PteBig),
                    self.format.level(MmuLevelIndex::PteSmall),
                ) else {
                    return Ok(None);
                };
                if small.valid
                    && let Some(t) = leaf_at(&state, small_desc, small.address)?
                {
                    return Ok(Some(t));
                }
                if big.valid {
                    return leaf_at(&state, big_desc, big.address);
                }
                return Ok(None);
            }
            let pointer = decode(EntryRole::Pde, raw)?;
            if !pointer.valid {
                return Ok(None);
            }
            table = pointer.address;
        }
        Ok(None)
    }

    /// One 64-bit word of subdevice `subdevice`'s memory.
    ///
    /// # Errors
    /// Unbacked memory.
    pub fn read_u64(
        &self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
    ) -> Result<u64, DriverError> {
        let mut raw = [0u8; 8];
        self.state.borrow().read(subdevice, aperture, address, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    fn tables_for(
        &self,
        vaspace: VaSpaceHandle,
        levels: impl Iterator<Item = &'static LevelDesc>,
        va: u64,
    ) -> Result<PageLevelInfo, DriverError> {
        let state = self.state.borrow();
        state.vaspace(vaspace)?;
        let levels = levels
            .filter_map(|desc| {
                state.table_of(vaspace, desc, va).map(|table| PageLevelDesc {
                    level: desc.index,
                    table,
                    aperture: TABLE_APERTURE,
                    table_size: desc.table_bytes(),
                })
            })
            .collect();
        Ok(PageLevelInfo { levels })
    }
}

fn encode_pde(version: gmmu_format::MmuVersion, bits: GmmuEntryBits) -> Result<u64, DriverError> {
    bits.encode(version, EntryRole::Pde)
        .map_err(|_| DriverError::InvalidArgument("directory entry not encodable"))
}

impl GmmuDriver for SimGpu {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn mmu_format(&self) -> &'static MmuFormat {
        self.format
    }

    fn subdevice_count(&self) -> u32 {
        u32::try_from(self.state.borrow().memory.len()).unwrap_or(u32::MAX)
    }

    fn vaspace_kind(&self, vaspace: VaSpaceHandle) -> Result<VaSpaceKind, DriverError> {
        Ok(self.state.borrow().vaspace(vaspace)?.kind)
    }

    fn get_page_level_info(
        &self,
        params: &PageLevelInfoParams,
    ) -> Result<PageLevelInfo, DriverError> {
        if self.state.borrow().legacy_only {
            return Err(DriverError::NotSupported("page level info"));
        }
        let leaf = self
            .format
            .leaf_level(params.page_size)
            .ok_or(DriverError::InvalidArgument("page size not supported by this format"))?;
        self.tables_for(params.vaspace, self.format.path_to(leaf), params.va.as_u64())
    }

    fn get_pde_info(&self, params: &PdeInfoParams) -> Result<PageLevelInfo, DriverError> {
        let levels = self
            .format
            .levels
            .iter()
            .filter(|l| l.index >= MmuLevelIndex::Pde0);
        self.tables_for(params.vaspace, levels, params.va.as_u64())
    }

    fn get_pte_info(&self, params: &PteInfoParams) -> Result<PteInfo, DriverError> {
        let state = self.state.borrow();
        let vs = state.vaspace(params.vaspace)?;
        if vs.kind != VaSpaceKind::Smmu {
            return Err(DriverError::NotSupported("PTE info outside SMMU address spaces"));
        }
        let page = align_down(params.va.as_u64(), params.page_size.bytes());
        Ok(vs.smmu.get(&page).copied().unwrap_or_default())
    }

    fn set_pte_info(&self, params: &SetPteInfoParams) -> Result<(), DriverError> {
        let mut state = self.state.borrow_mut();
        let vs = state.vaspace_mut(params.vaspace)?;
        if vs.kind != VaSpaceKind::Smmu {
            return Err(DriverError::NotSupported("PTE info outside SMMU address spaces"));
        }
        let page = align_down(params.va.as_u64(), params.page_size.bytes());
        vs.smmu.insert(page, params.pte);
        Ok(())
    }

    fn read_phys(
        &self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
        buf: &mut [u8],
    ) -> Result<(), DriverError> {
        self.state.borrow().read(subdevice, aperture, address, buf)
    }

    fn write_phys(
        &self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let mut state = self.state.borrow_mut();
        if let Some((faulty, region)) = &state.write_fault {
            let start = address.as_u64();
            let end = start + data.len() as u64;
            if *faulty == aperture && start < region.end && region.start < end {
                log::trace!(
                    "sim: failing write of {:#x} bytes at {aperture:?} {address:?}",
                    data.len()
                );
                return Err(DriverError::InvalidAddress { aperture, address });
            }
        }
        state.write(subdevice, aperture, address, data)
    }

    fn invalidate_tlb(&self, params: &InvalidateTlbParams) -> Result<(), DriverError> {
        let mut state = self.state.borrow_mut();
        state.vaspace(params.vaspace)?;
        log::trace!("sim: TLB invalidate {:?}", params.vaspace);
        state.tlb_log.push(params.vaspace);
        Ok(())
    }
}

impl PmDevice for SimGpu {
    fn alloc_buffer(&self, desc: &BufferDesc) -> Result<Box<dyn Buffer>, DriverError> {
        let buffer = self.alloc(desc.vaspace, desc.location, desc.size, desc.page_size)?;
        Ok(Box::new(buffer))
    }
}

/// A buffer handed out by [`SimGpu`]: physically contiguous, mapped at one
/// page size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SimBuffer {
    size: u64,
    mem: MemHandle,
    location: Location,
    virt_base: GpuVirtualAddress,
    vaspace: VaSpaceHandle,
    page_size: PageSize,
    phys: Option<PhysicalAddress>,
    ats: bool,
}

impl SimBuffer {
    /// Physical base, if backed.
    #[must_use]
    pub const fn phys_base(&self) -> Option<PhysicalAddress> {
        self.phys
    }

    #[must_use]
    pub fn boxed(self) -> Box<dyn Buffer> {
        Box::new(self)
    }
}

impl Buffer for SimBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn mem_handle(&self) -> MemHandle {
        self.mem
    }

    fn phys_offset(&self) -> u64 {
        0
    }

    fn location(&self) -> Location {
        self.location
    }

    fn virt_base(&self) -> GpuVirtualAddress {
        self.virt_base
    }

    fn vaspace(&self) -> VaSpaceHandle {
        self.vaspace
    }

    fn page_size(&self) -> PageSize {
        self.page_size
    }

    fn is_allocated(&self) -> bool {
        self.phys.is_some()
    }

    fn is_ats(&self) -> bool {
        self.ats
    }

    fn phys_addr(&self, offset: u64) -> PhysicalAddress {
        self.phys.unwrap_or_default() + offset
    }
}

/// A command channel that records methods until drained.
#[derive(Debug, Default)]
pub struct SimChannel {
    methods: Vec<(u32, u32, u32)>,
    depth: u32,
    brackets: usize,
}

impl SimChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Methods queued since the last drain.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.methods.len()
    }

    /// Completed `begin`/`end` brackets since the last drain.
    #[must_use]
    pub const fn operations(&self) -> usize {
        self.brackets
    }

    /// Execute the queued methods on every subdevice of `gpu`, in order.
    /// Returns the number of copy-engine launches.
    ///
    /// # Errors
    /// [`DriverError::InvalidArgument`] inside an open bracket; access
    /// errors of the launches. Methods after a failing launch are dropped.
    pub fn drain(&mut self, gpu: &SimGpu) -> Result<usize, DriverError> {
        if self.depth != 0 {
            return Err(DriverError::InvalidArgument("channel drained inside a bracket"));
        }
        let methods = std::mem::take(&mut self.methods);
        self.brackets = 0;
        let mut decoder = CeDecoder::new();
        let mut launches = 0;
        for (subchannel, offset, value) in methods {
            let Some(op) = decoder.method(subchannel, offset, value) else {
                continue;
            };
            launches += 1;
            for subdevice in 0..gpu.subdevice_count() {
                execute(gpu, subdevice, op)?;
            }
        }
        log::debug!("sim: drained {launches} copy-engine launches");
        Ok(launches)
    }
}

fn execute(gpu: &SimGpu, subdevice: u32, op: CeOp) -> Result<(), DriverError> {
    match op {
        CeOp::Copy { src, dst, len } => {
            let mut buf = vec![0u8; to_usize(len)];
            gpu.read_phys(subdevice, src.aperture, src.address, &mut buf)?;
            gpu.write_phys(subdevice, dst.aperture, dst.address, &buf)
        }
        CeOp::Fill { dst, len, pattern } => {
            let bytes: Vec<u8> = pattern
                .to_le_bytes()
                .into_iter()
                .cycle()
                .take(to_usize(len))
                .collect();
            gpu.write_phys(subdevice, dst.aperture, dst.address, &bytes)
        }
    }
}

impl CommandChannel for SimChannel {
    fn begin(&mut self) {
        self.depth += 1;
    }

    fn method(&mut self, subchannel: u32, offset: u32, value: u32) {
        self.methods.push((subchannel, offset, value));
    }

    fn end(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.brackets += 1;
    }
}

/// Logger for test binaries, writing `[LEVEL] target: message` to stderr.
pub struct SimLogger {
    max_level: LevelFilter,
}

impl SimLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install as the global logger.
    ///
    /// # Errors
    /// If a logger is already installed.
    pub fn init(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for SimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install a [`SimLogger`] once per test binary. The level comes from
/// `GMMU_LOG` (`error` .. `trace`) and defaults to `warn`.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let level = std::env::var("GMMU_LOG")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LevelFilter::Warn);
        if SimLogger::new(level).init().is_err() {
            log::warn!("a logger was already installed");
        }
    });
}
