//! # V3 entries
//!
//! Cacheability, permissions, atomics and access counting are packed into a
//! Permission Control Field whose meaning depends on the VALID bit. See
//! [`crate::pcf`] for the value tables.
//!
//! | Bits  | PTE           | PDE           |
//! |-------|---------------|---------------|
//! | 0     | VALID         | IS_PTE (0)    |
//! | 2:1   | APERTURE      | APERTURE (0 = unmapped) |
//! | 7:3   | PCF (5 bits)  | 5:3 PCF (3 bits), 11:6 reserved |
//! | 11:8  | KIND          |               |
//! | 51:12 | ADDRESS >> 12 | ADDRESS >> 12 |
//! | 63:52 | reserved      | reserved      |

use bitfield_struct::bitfield;
use gmmu_addresses::PhysicalAddress;

/// V3 leaf entry.
#[bitfield(u64)]
pub struct PteV3 {
    /// **Valid** (bit 0). Also selects which PCF table applies.
    pub valid: bool,

    /// **Aperture** (bits 2:1).
    #[bits(2)]
    pub aperture: u8,

    /// **Permission Control Field** (bits 7:3).
    #[bits(5)]
    pub pcf: u8,

    /// **Kind** (bits 11:8).
    #[bits(4)]
    pub kind: u8,

    /// Page base bits [51:12].
    #[bits(40)]
    address_51_12: u64,

    #[bits(12)]
    __res_63_52: u16,
}

/// V3 directory entry.
#[bitfield(u64)]
pub struct PdeV3 {
    /// **IS_PTE** (bit 0): always 0 for a directory pointer.
    pub is_pte: bool,

    /// **Aperture** (bits 2:1) of the lower table, `0` if unmapped.
    #[bits(2)]
    pub aperture: u8,

    /// **Permission Control Field** (bits 5:3).
    #[bits(3)]
    pub pcf: u8,

    #[bits(6)]
    __res_11_6: u8,

    /// Lower-table base bits [51:12].
    #[bits(40)]
    address_51_12: u64,

    #[bits(12)]
    __res_63_52: u16,
}

/// Largest address (exclusive) the 40-bit field can hold.
pub const ADDRESS_LIMIT: u64 = 1 << (40 + 12);

/// Largest kind value plus one.
pub const KIND_LIMIT: u8 = 1 << 4;

impl PteV3 {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned_to(0x1000));
        self.set_address_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.address_51_12() << 12)
    }
}

impl PdeV3 {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned_to(0x1000));
        self.set_address_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.address_51_12() << 12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_field_positions() {
        let mut pte = PteV3::new().with_valid(true).with_aperture(3).with_pcf(0x1F);
        pte.set_physical_address(PhysicalAddress::new(0xF_FFFF_F000));
        let raw = pte.into_bits();
        assert_eq!(raw & 0xFF, 0xFF);
        assert_eq!(raw >> 12, 0xF_FFFF);
    }

    #[test]
    fn pde_pcf_is_three_bits() {
        let pde = PdeV3::new().with_aperture(1).with_pcf(0b110);
        assert_eq!(pde.into_bits(), 0b11_0010);
    }
}
