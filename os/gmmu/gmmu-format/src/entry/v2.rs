//! # V1/V2 entries
//!
//! Every attribute is an independent bit. The VOL bit is overloaded: on a
//! valid PTE it marks the mapping uncached (volatile), on an invalid PTE it
//! marks the entry sparse.
//!
//! | Bits  | PTE              | PDE              |
//! |-------|------------------|------------------|
//! | 0     | VALID            | IS_PTE (0)       |
//! | 2:1   | APERTURE         | APERTURE (0 = unmapped) |
//! | 3     | VOL              | VOL              |
//! | 4     | reserved         | reserved         |
//! | 5     | PRIVILEGE        | reserved         |
//! | 6     | READ_ONLY        | reserved         |
//! | 7     | ATOMIC_DISABLE (V2; reserved on V1) | reserved |
//! | 53:8  | ADDRESS >> 12    | ADDRESS >> 12    |
//! | 55:54 | reserved         | reserved         |
//! | 63:56 | KIND             | reserved         |

use bitfield_struct::bitfield;
use gmmu_addresses::PhysicalAddress;

/// V1/V2 leaf entry.
#[bitfield(u64)]
pub struct PteV2 {
    /// **Valid** (bit 0).
    pub valid: bool,

    /// **Aperture** (bits 2:1): video, peer, coherent or non-coherent sysmem.
    #[bits(2)]
    pub aperture: u8,

    /// **Volatile** (bit 3): uncached when valid, sparse when invalid.
    pub vol: bool,

    #[bits(1)]
    __res_4: u8,

    /// **Privileged** (bit 5): only privileged engines may access.
    pub privilege: bool,

    /// **Read-only** (bit 6).
    pub read_only: bool,

    /// **Atomic disable** (bit 7). Reserved on V1.
    pub atomic_disable: bool,

    /// Page base bits [57:12].
    #[bits(46)]
    address_57_12: u64,

    #[bits(2)]
    __res_55_54: u8,

    /// **Kind** (bits 63:56): compression/storage kind.
    #[bits(8)]
    pub kind: u8,
}

/// V1/V2 directory entry (one half of a dual PDE0, or a whole upper PDE).
#[bitfield(u64)]
pub struct PdeV2 {
    /// **IS_PTE** (bit 0): always 0 for a directory pointer.
    pub is_pte: bool,

    /// **Aperture** (bits 2:1) of the lower table, `0` if unmapped.
    #[bits(2)]
    pub aperture: u8,

    /// **Volatile** (bit 3): uncached table when mapped, sparse when not.
    pub vol: bool,

    #[bits(4)]
    __res_7_4: u8,

    /// Lower-table base bits [57:12].
    #[bits(46)]
    address_57_12: u64,

    #[bits(10)]
    __res_63_54: u16,
}

/// Largest address (exclusive) the 46-bit field can hold.
pub const ADDRESS_LIMIT: u64 = 1 << (46 + 12);

impl PteV2 {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned_to(0x1000));
        self.set_address_57_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.address_57_12() << 12)
    }
}

impl PdeV2 {
    /// Set the lower table base (must be 4 KiB-aligned).
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned_to(0x1000));
        self.set_address_57_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.address_57_12() << 12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_field_positions() {
        let mut pte = PteV2::new()
            .with_valid(true)
            .with_aperture(2)
            .with_read_only(true)
            .with_kind(0xFE);
        pte.set_physical_address(PhysicalAddress::new(0x12_3456_7000));
        let raw = pte.into_bits();
        assert_eq!(raw & 0xFF, 0b0100_0101);
        assert_eq!((raw >> 8) & ((1 << 46) - 1), 0x12_3456_7);
        assert_eq!(raw >> 56, 0xFE);
        assert_eq!(
            PteV2::from_bits(raw).physical_address(),
            PhysicalAddress::new(0x12_3456_7000)
        );
    }

    #[test]
    fn pde_never_sets_leaf_bit() {
        let mut pde = PdeV2::new().with_aperture(1).with_vol(true);
        pde.set_physical_address(PhysicalAddress::new(0x4000));
        let raw = pde.into_bits();
        assert_eq!(raw & 1, 0);
        assert_eq!(raw, 0b1010 | (0x4 << 8));
    }
}
