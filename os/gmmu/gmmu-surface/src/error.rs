use crate::SurfaceId;
use gmmu_addresses::PageSize;
use gmmu_tree::{DriverError, MmuError};

/// Why two mappings cannot be joined.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinMismatch {
    #[error("mappings belong to different surfaces")]
    Surface,
    #[error("mappings are not adjacent")]
    NotAdjacent,
    #[error("mappings differ in kind")]
    Kind,
    #[error("mappings use different page sizes")]
    PageSize,
    #[error("mappings are backed by different allocations")]
    Handle,
    #[error("backing offsets are not contiguous")]
    MemOffset,
    #[error("physical addresses are not contiguous")]
    Physical,
    #[error("mappings have different attributes")]
    Attributes,
    #[error("one mapping has sub-mappings")]
    Nested,
}

/// Errors of surface and mapping operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),
    #[error("software error: {0}")]
    SoftwareError(&'static str),
    /// Only 2M to/from 4K or 64K, and 4K to/from 64K, are direct transitions.
    #[error("cannot change page size from {from} to {to} directly; change it in two steps")]
    PageSizeTransition { from: PageSize, to: PageSize },
    #[error("surface {0:?} does not exist")]
    NoSuchSurface(SurfaceId),
    #[error("surface has no backing memory")]
    NotAllocated,
    #[error(transparent)]
    Join(#[from] JoinMismatch),
    #[error(transparent)]
    Mmu(#[from] MmuError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}
