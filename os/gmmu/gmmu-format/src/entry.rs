//! # Raw entry layouts
//!
//! Packed 64-bit views of PTEs and PDEs, one module per layout family:
//!
//! - [`v2`]: the independent-bit layout shared by V1 and V2 (V1 leaves the
//!   atomic-disable bit reserved).
//! - [`v3`]: the packed-PCF layout.
//!
//! The dual PDE0 entry is two consecutive 64-bit PDEs: the lo half points to
//! the big-page table (or is itself a 2 MiB leaf), the hi half to the
//! small-page table.
//!
//! Raw types never validate. Use [`GmmuEntryBits`](crate::GmmuEntryBits) for
//! checked conversions.

pub mod v2;
pub mod v3;

use gmmu_addresses::Aperture;

/// Bit 0 of every PTE is VALID and of every PDE is IS_PTE (always 0 for a
/// directory pointer). A set bit 0 therefore identifies a valid leaf.
pub const LEAF_BIT: u64 = 1 << 0;

/// Whether `raw` is unambiguously a valid leaf translation.
#[inline]
#[must_use]
pub const fn is_valid_leaf(raw: u64) -> bool {
    raw & LEAF_BIT != 0
}

/// Aperture field of a leaf entry. Every value decodes.
#[must_use]
pub const fn pte_aperture_from_hw(v: u8) -> Aperture {
    match v & 0b11 {
        0 => Aperture::Video,
        1 => Aperture::Peer,
        2 => Aperture::SysCoherent,
        _ => Aperture::SysNonCoherent,
    }
}

/// Aperture field of a leaf entry. [`Aperture::Invalid`] is stored as `0`
/// (the entry's VALID bit carries the distinction).
#[must_use]
pub const fn pte_aperture_to_hw(a: Aperture) -> u8 {
    match a {
        Aperture::Invalid | Aperture::Video => 0,
        Aperture::Peer => 1,
        Aperture::SysCoherent => 2,
        Aperture::SysNonCoherent => 3,
    }
}

/// Aperture field of a directory entry. `0` is an unmapped slot.
#[must_use]
pub const fn pde_aperture_from_hw(v: u8) -> Aperture {
    match v & 0b11 {
        0 => Aperture::Invalid,
        1 => Aperture::Video,
        2 => Aperture::SysCoherent,
        _ => Aperture::SysNonCoherent,
    }
}

/// Aperture field of a directory entry. Page tables never live in peer
/// memory, so [`Aperture::Peer`] has no encoding.
#[must_use]
pub const fn pde_aperture_to_hw(a: Aperture) -> Option<u8> {
    match a {
        Aperture::Invalid => Some(0),
        Aperture::Video => Some(1),
        Aperture::SysCoherent => Some(2),
        Aperture::SysNonCoherent => Some(3),
        Aperture::Peer => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_apertures_roundtrip() {
        for a in [
            Aperture::Video,
            Aperture::Peer,
            Aperture::SysCoherent,
            Aperture::SysNonCoherent,
        ] {
            assert_eq!(pte_aperture_from_hw(pte_aperture_to_hw(a)), a);
        }
    }

    #[test]
    fn peer_tables_are_unencodable() {
        assert_eq!(pde_aperture_to_hw(Aperture::Peer), None);
        assert_eq!(pde_aperture_from_hw(0), Aperture::Invalid);
    }

    #[test]
    fn leaf_bit() {
        assert!(is_valid_leaf(0x1));
        assert!(!is_valid_leaf(0x1_0000_0002));
    }
}
