//! # Device driver boundary
//!
//! The mirror never owns page-table storage. Everything it knows about the
//! tables comes from, and every write goes through, a [`GmmuDriver`]:
//!
//! - **Layout queries**: [`get_page_level_info`](GmmuDriver::get_page_level_info)
//!   returns every level from the root to the table holding leaves of one
//!   page size in a single call; the legacy
//!   [`get_pde_info`](GmmuDriver::get_pde_info) covers one PDE0 entry per call.
//! - **Physical access**: [`read_phys`](GmmuDriver::read_phys) and
//!   [`write_phys`](GmmuDriver::write_phys) per subdevice.
//! - **Per-page PTE access** for SMMU address spaces.
//! - **TLB invalidation** by address space.
//!
//! Request and response structures are `#[repr(C)]` and laid out like the
//! control calls they stand for.

use crate::DriverError;
use alloc::vec::Vec;
use bitflags::bitflags;
use gmmu_addresses::{
    Aperture, DeviceId, GpuVirtualAddress, PageSize, PhysicalAddress, VaSpaceHandle,
};
use gmmu_format::{MmuFormat, MmuLevelIndex};

/// Translation hardware behind an address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VaSpaceKind {
    /// GPU page tables, walked by this crate.
    Gmmu,
    /// System MMU page tables, reachable only per page through the driver.
    Smmu,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageLevelInfoParams {
    pub vaspace: VaSpaceHandle,
    pub va: GpuVirtualAddress,
    /// Page size whose leaf table terminates the returned chain.
    pub page_size: PageSize,
}

/// One table on the walk for a virtual address.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageLevelDesc {
    pub level: MmuLevelIndex,
    /// Base of the table (entry 0).
    pub table: PhysicalAddress,
    pub aperture: Aperture,
    /// Table size in bytes.
    pub table_size: u64,
}

/// Tables found for a query, root first. Levels without a table are omitted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PageLevelInfo {
    pub levels: Vec<PageLevelDesc>,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdeInfoParams {
    pub vaspace: VaSpaceHandle,
    /// Any address inside the PDE0 entry of interest.
    pub va: GpuVirtualAddress,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PteInfoParams {
    pub vaspace: VaSpaceHandle,
    pub va: GpuVirtualAddress,
    pub page_size: PageSize,
}

bitflags! {
    /// Raw attribute flags of an SMMU PTE as reported by the driver.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct SmmuPteFlags: u32 {
        const READ_ONLY = 1 << 0;
        const UNCACHED = 1 << 1;
        const PRIVILEGED = 1 << 2;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PteInfo {
    pub valid: bool,
    pub aperture: Aperture,
    pub address: PhysicalAddress,
    pub flags: SmmuPteFlags,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SetPteInfoParams {
    pub vaspace: VaSpaceHandle,
    pub va: GpuVirtualAddress,
    pub page_size: PageSize,
    pub pte: PteInfo,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InvalidateTlbParams {
    pub vaspace: VaSpaceHandle,
}

/// Privileged access to one GPU device.
///
/// Methods take `&self`: the driver is a handle to external state, not the
/// state itself.
pub trait GmmuDriver {
    fn device_id(&self) -> DeviceId;

    /// Entry format of this device's GMMU.
    fn mmu_format(&self) -> &'static MmuFormat;

    /// Number of subdevices sharing each page table (all are written).
    fn subdevice_count(&self) -> u32;

    /// # Errors
    /// [`DriverError::NoSuchVaSpace`] for unknown handles.
    fn vaspace_kind(&self, vaspace: VaSpaceHandle) -> Result<VaSpaceKind, DriverError>;

    /// Modern layout query.
    ///
    /// # Errors
    /// [`DriverError::NotSupported`] on drivers that only offer the legacy
    /// query.
    fn get_page_level_info(
        &self,
        params: &PageLevelInfoParams,
    ) -> Result<PageLevelInfo, DriverError>;

    /// Legacy layout query: the PDE0 table and the leaf tables below one
    /// PDE0 entry.
    ///
    /// # Errors
    /// Driver-specific.
    fn get_pde_info(&self, params: &PdeInfoParams) -> Result<PageLevelInfo, DriverError>;

    /// # Errors
    /// [`DriverError::NotSupported`] outside SMMU address spaces.
    fn get_pte_info(&self, params: &PteInfoParams) -> Result<PteInfo, DriverError>;

    /// # Errors
    /// [`DriverError::NotSupported`] outside SMMU address spaces.
    fn set_pte_info(&self, params: &SetPteInfoParams) -> Result<(), DriverError>;

    /// # Errors
    /// [`DriverError::InvalidAddress`] for unbacked memory.
    fn read_phys(
        &self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
        buf: &mut [u8],
    ) -> Result<(), DriverError>;

    /// # Errors
    /// [`DriverError::InvalidAddress`] for unbacked memory.
    fn write_phys(
        &self,
        subdevice: u32,
        aperture: Aperture,
        address: PhysicalAddress,
        data: &[u8],
    ) -> Result<(), DriverError>;

    /// # Errors
    /// [`DriverError::NoSuchVaSpace`] for unknown handles.
    fn invalidate_tlb(&self, params: &InvalidateTlbParams) -> Result<(), DriverError>;

    /// Write `data` to every subdevice.
    ///
    /// # Errors
    /// The first failing [`write_phys`](Self::write_phys).
    fn broadcast_phys(
        &self,
        aperture: Aperture,
        address: PhysicalAddress,
        data: &[u8],
    ) -> Result<(), DriverError> {
        for subdevice in 0..self.subdevice_count() {
            self.write_phys(subdevice, aperture, address, data)?;
        }
        Ok(())
    }
}
