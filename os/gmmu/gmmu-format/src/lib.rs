//! # GMMU Entry Formats
//!
//! Bit-exact models of the GPU page-table hierarchy for three successive
//! hardware generations, and the codec that translates the packed
//! Permission Control Field (PCF) of the newest generation into a stable,
//! generation-independent bitmask.
//!
//! ## What you get
//! - [`MmuFormat`] descriptors ([`MmuFormat::V1`], [`MmuFormat::V2`], [`MmuFormat::V3`])
//!   listing every [level](MmuLevelIndex) with its VA bits, entry size and
//!   leaf page size.
//! - Raw [`entry`] bitfields for PTEs and PDEs of each generation.
//! - [`GmmuEntryBits`]: one decoded, semantic view over all raw forms, with
//!   [`decode`](GmmuEntryBits::decode)/[`encode`](GmmuEntryBits::encode).
//! - The [`pcf`] codec: [`SwPtePcf`]/[`SwPdePcf`] masks and the hardware tables.
//!
//! ## GPU VA → PA walk
//!
//! ```text
//!  PDE4 → PDE3 → PDE2 → PDE1 ─┬─────────────────► 512 MiB leaf (V3 only)
//!                             └► PDE0 (dual) ─┬─► 2 MiB leaf (lo half)
//!                                             ├─► big PT   (lo half) → 64 KiB PTE
//!                                             └─► small PT (hi half) → 4 KiB PTE
//! ```
//!
//! | Level | V1/V2 VA bits | V3 VA bits | Entry | Notes |
//! |:------|:-------------|:-----------|:------|:------|
//! | PDE4 | – | 56 | 8 B | V3 only |
//! | PDE3 | 48:47 | 55:47 | 8 B | |
//! | PDE2 | 46:38 | 46:38 | 8 B | |
//! | PDE1 | 37:29 | 37:29 | 8 B | giant (512 MiB) leaf on V3 |
//! | PDE0 | 28:21 | 28:21 | 16 B | huge (2 MiB) leaf in the lo half |
//! | PTE big | 20:16 | 20:16 | 8 B | 64 KiB pages |
//! | PTE small | 20:12 | 20:12 | 8 B | 4 KiB pages |
//!
//! ### Leaf vs. directory in dual-purpose slots
//!
//! A PDE1 or PDE0 slot either points to a lower table or is itself a leaf.
//! A *valid* leaf is recognizable from bit 0. An *invalid* leaf, however, can be
//! bit-identical to an unmapped directory slot, so the decoder cannot tell
//! them apart from the bits alone; the caller supplies the [`EntryRole`].
//!
//! ### Permission bits per generation
//!
//! - **V1**: independent VALID/VOL/PRIVILEGE/READ_ONLY bits; no atomic control.
//! - **V2**: V1 plus an independent ATOMIC_DISABLE bit.
//! - **V3**: VALID plus a packed PCF that combines caching, read-only,
//!   atomics, privilege and access counting (or sparse/nowhere states).

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod entry;
mod bits;
mod level;
pub mod pcf;

pub use crate::bits::{EntryRole, GmmuEntryBits};
pub use crate::level::{LevelDesc, MmuFormat, MmuLevelIndex};
pub use crate::pcf::{PcfBit, SwPdePcf, SwPtePcf};
use gmmu_addresses::{Aperture, PhysicalAddress};

/// Hardware generation of the page-table format.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MmuVersion {
    /// Independent attribute bits, no atomic-disable field.
    V1,
    /// Independent attribute bits including atomic-disable.
    V2,
    /// Packed permission control field.
    V3,
}

impl MmuVersion {
    /// Whether permission attributes are packed into a PCF.
    #[inline]
    #[must_use]
    pub const fn uses_pcf(self) -> bool {
        matches!(self, Self::V3)
    }
}

/// Errors from encoding or decoding raw entries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("{what} is not supported by GMMU {version:?}")]
    Unsupported {
        version: MmuVersion,
        what: &'static str,
    },
    #[error("hardware {role:?} PCF 0x{value:02X} is not defined (valid={valid})")]
    InvalidPcf {
        role: EntryRole,
        value: u8,
        valid: bool,
    },
    #[error("software {role:?} PCF {bits:#x} has no hardware encoding (valid={valid})")]
    UnrepresentablePcf {
        role: EntryRole,
        bits: u32,
        valid: bool,
    },
    #[error("aperture {aperture:?} cannot be encoded in a {role:?}")]
    BadAperture { aperture: Aperture, role: EntryRole },
    #[error("address {address} does not fit the entry address field")]
    AddressOutOfRange { address: PhysicalAddress },
}
