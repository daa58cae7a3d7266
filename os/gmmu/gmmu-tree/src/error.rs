use crate::modify::EntryOps;
use gmmu_addresses::{Aperture, PhysicalAddress, VaSpaceHandle};
use gmmu_format::{FormatError, MmuLevelIndex};

/// Failures reported by a [`GmmuDriver`](crate::GmmuDriver).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The control call does not exist on this driver or in this mode.
    #[error("driver call not supported: {0}")]
    NotSupported(&'static str),
    #[error("unknown address space {0:?}")]
    NoSuchVaSpace(VaSpaceHandle),
    #[error("physical address {address} in {aperture:?} is not backed")]
    InvalidAddress {
        aperture: Aperture,
        address: PhysicalAddress,
    },
    #[error("driver rejected argument: {0}")]
    InvalidArgument(&'static str),
    #[error("out of memory")]
    OutOfMemory,
}

impl DriverError {
    /// Whether a different query path may succeed.
    #[must_use]
    pub const fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}

/// Errors of the page-table mirror.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmuError {
    /// Out-of-range offsets, unaligned boundaries and the like.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// No hardware encoding for the request on this generation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Op or flag combination violates a precondition.
    #[error("bad parameter: {0}")]
    BadParameter(&'static str),
    /// Internal bookkeeping out of sync.
    #[error("software error: {0}")]
    SoftwareError(&'static str),
    /// Operations left over after a batch pass.
    #[error("operations {ops:?} are not supported at {level:?}")]
    UnsupportedOps { level: MmuLevelIndex, ops: EntryOps },
    /// The level has no table for this part of the surface.
    #[error("no {level:?} table backs surface offset {offset:#x}")]
    NoPageTable { level: MmuLevelIndex, offset: u64 },
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Format(#[from] FormatError),
}
