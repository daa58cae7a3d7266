//! Collaborators owned by the caller: the buffer a surface wraps and the
//! device that can allocate more of them.

use alloc::boxed::Box;
use gmmu_addresses::{
    GpuVirtualAddress, Location, MemHandle, PageSize, PhysicalAddress, VaSpaceHandle,
};
use gmmu_tree::{DriverError, GmmuDriver};

/// A GPU buffer: backing memory plus a fixed virtual mapping.
pub trait Buffer {
    /// Size in bytes; a multiple of [`page_size`](Self::page_size).
    fn size(&self) -> u64;

    /// Allocation the backing memory belongs to.
    fn mem_handle(&self) -> MemHandle;

    /// Offset of the buffer inside its allocation.
    fn phys_offset(&self) -> u64;

    fn location(&self) -> Location;

    fn virt_base(&self) -> GpuVirtualAddress;

    fn vaspace(&self) -> VaSpaceHandle;

    /// Page size the buffer was mapped with.
    fn page_size(&self) -> PageSize;

    /// Whether backing memory exists yet.
    fn is_allocated(&self) -> bool;

    /// Whether device accesses bypass the GMMU through ATS.
    fn is_ats(&self) -> bool {
        false
    }

    /// Original physical address of byte `offset`, ignoring any remap.
    fn phys_addr(&self, offset: u64) -> PhysicalAddress;
}

/// Parameters of an internal allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferDesc {
    pub size: u64,
    pub location: Location,
    pub page_size: PageSize,
    pub vaspace: VaSpaceHandle,
}

/// A device that can also allocate buffers.
pub trait PmDevice: GmmuDriver {
    /// Allocate and map a buffer. Used for the donor memory of physical moves.
    ///
    /// # Errors
    /// [`DriverError::OutOfMemory`] and driver-specific failures.
    fn alloc_buffer(&self, desc: &BufferDesc) -> Result<Box<dyn Buffer>, DriverError>;
}
