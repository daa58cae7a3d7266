use crate::entry::{
    pde_aperture_from_hw, pde_aperture_to_hw, pte_aperture_from_hw, pte_aperture_to_hw, v2, v3,
};
use crate::pcf::{self, SwPdePcf, SwPtePcf};
use crate::{FormatError, MmuVersion};
use gmmu_addresses::{Aperture, PhysicalAddress};
use utils_accessors_derive::Setters;

/// How a raw 64-bit entry is interpreted.
///
/// Leaf-only levels always hold [`Pte`](Self::Pte)s and pure directory
/// levels always hold [`Pde`](Self::Pde)s. Dual-purpose levels (PDE1 on V3,
/// PDE0) can hold either; the owner of the entry decides.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum EntryRole {
    /// Leaf translation.
    Pte,
    /// Pointer to a lower table.
    #[default]
    Pde,
}

/// Unified, decoded view over every PTE/PDE layout.
///
/// Like the raw layouts it replaces, this type models the *semantic superset*
/// of fields. Which fields are meaningful depends on the role and on the
/// entry's state:
///
/// | Field | PTE valid | PTE invalid | PDE mapped | PDE unmapped |
/// |-------|:---------:|:-----------:|:----------:|:------------:|
/// | `uncached` | ✓ | | ✓ | |
/// | `sparse` | | ✓ | | ✓ |
/// | `read_only`, `atomic_disable`, `privilege`, `ace` | ✓ | V1/V2 only | | |
/// | `no_valid_4k`, `mapping_nowhere` | | V3 only | | |
/// | `ats_disallowed` | | | V3 | V3 |
///
/// For a PDE, `valid` mirrors `aperture != Invalid`.
///
/// [`encode`](Self::encode) drops fields that do not apply to the state, so
/// `decode(encode(x))` is the normalized form of `x` that hardware would
/// read back.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Setters)]
#[allow(clippy::struct_excessive_bools)]
pub struct GmmuEntryBits {
    /// PTE: the VALID bit. PDE: whether a lower table is attached.
    pub valid: bool,
    pub aperture: Aperture,
    /// Page base (PTE) or lower table base (PDE), 4 KiB-aligned.
    pub address: PhysicalAddress,
    /// Storage kind (PTE only).
    pub kind: u8,
    pub uncached: bool,
    pub sparse: bool,
    pub read_only: bool,
    pub atomic_disable: bool,
    pub privilege: bool,
    /// Access counting enabled (V3 only).
    pub ace: bool,
    pub no_valid_4k: bool,
    pub mapping_nowhere: bool,
    pub ats_disallowed: bool,
}

impl GmmuEntryBits {
    /// A valid leaf translating to `address` in `aperture`.
    #[must_use]
    pub const fn leaf(aperture: Aperture, address: PhysicalAddress) -> Self {
        Self {
            valid: true,
            aperture,
            address,
            kind: 0,
            uncached: false,
            sparse: false,
            read_only: false,
            atomic_disable: false,
            privilege: false,
            ace: false,
            no_valid_4k: false,
            mapping_nowhere: false,
            ats_disallowed: false,
        }
    }

    /// A directory pointer to a table at `address` in `aperture`.
    #[must_use]
    pub const fn table(aperture: Aperture, address: PhysicalAddress) -> Self {
        Self::leaf(aperture, address)
    }

    /// Software PCF of this entry read as a PTE (untrimmed).
    #[must_use]
    pub fn pte_pcf(&self) -> SwPtePcf {
        let mut sw = SwPtePcf::empty();
        sw.set(SwPtePcf::SPARSE, self.sparse);
        sw.set(SwPtePcf::NO_VALID_4KB_PAGE, self.no_valid_4k);
        sw.set(SwPtePcf::MAPPING_NOWHERE, self.mapping_nowhere);
        sw.set(SwPtePcf::UNCACHED, self.uncached);
        sw.set(SwPtePcf::READ_ONLY, self.read_only);
        sw.set(SwPtePcf::NO_ATOMIC, self.atomic_disable);
        sw.set(SwPtePcf::PRIVILEGE, self.privilege);
        sw.set(SwPtePcf::ACE, self.ace);
        sw
    }

    /// Replace every PCF-carried attribute with the bits of `sw`.
    pub const fn set_pte_pcf(&mut self, sw: SwPtePcf) -> &mut Self {
        self.sparse = sw.contains(SwPtePcf::SPARSE);
        self.no_valid_4k = sw.contains(SwPtePcf::NO_VALID_4KB_PAGE);
        self.mapping_nowhere = sw.contains(SwPtePcf::MAPPING_NOWHERE);
        self.uncached = sw.contains(SwPtePcf::UNCACHED);
        self.read_only = sw.contains(SwPtePcf::READ_ONLY);
        self.atomic_disable = sw.contains(SwPtePcf::NO_ATOMIC);
        self.privilege = sw.contains(SwPtePcf::PRIVILEGE);
        self.ace = sw.contains(SwPtePcf::ACE);
        self
    }

    /// Software PCF of this entry read as a PDE (untrimmed).
    #[must_use]
    pub fn pde_pcf(&self) -> SwPdePcf {
        let mut sw = SwPdePcf::empty();
        sw.set(SwPdePcf::SPARSE, self.sparse);
        sw.set(SwPdePcf::UNCACHED, self.uncached);
        sw.set(SwPdePcf::ATS_NOT_ALLOWED, self.ats_disallowed);
        sw
    }

    pub const fn set_pde_pcf(&mut self, sw: SwPdePcf) -> &mut Self {
        self.sparse = sw.contains(SwPdePcf::SPARSE);
        self.uncached = sw.contains(SwPdePcf::UNCACHED);
        self.ats_disallowed = sw.contains(SwPdePcf::ATS_NOT_ALLOWED);
        self
    }

    /// Decode a raw 64-bit entry.
    ///
    /// # Errors
    /// [`FormatError::InvalidPcf`] if a V3 entry holds an undefined PCF value.
    pub fn decode(version: MmuVersion, role: EntryRole, raw: u64) -> Result<Self, FormatError> {
        let bits = match (version, role) {
            (MmuVersion::V1 | MmuVersion::V2, EntryRole::Pte) => {
                let e = v2::PteV2::from_bits(raw);
                let valid = e.valid();
                Self {
                    valid,
                    aperture: decode_pte_aperture(valid, e.aperture(), e.physical_address()),
                    address: e.physical_address(),
                    kind: e.kind(),
                    uncached: valid && e.vol(),
                    sparse: !valid && e.vol(),
                    read_only: e.read_only(),
                    atomic_disable: version == MmuVersion::V2 && e.atomic_disable(),
                    privilege: e.privilege(),
                    ..Self::default()
                }
            }
            (MmuVersion::V1 | MmuVersion::V2, EntryRole::Pde) => {
                let e = v2::PdeV2::from_bits(raw);
                let aperture = pde_aperture_from_hw(e.aperture());
                let valid = aperture != Aperture::Invalid;
                Self {
                    valid,
                    aperture,
                    address: e.physical_address(),
                    uncached: valid && e.vol(),
                    sparse: !valid && e.vol(),
                    ..Self::default()
                }
            }
            (MmuVersion::V3, EntryRole::Pte) => {
                let e = v3::PteV3::from_bits(raw);
                let valid = e.valid();
                let mut bits = Self {
                    valid,
                    aperture: decode_pte_aperture(valid, e.aperture(), e.physical_address()),
                    address: e.physical_address(),
                    kind: e.kind(),
                    ..Self::default()
                };
                bits.set_pte_pcf(pcf::pte_pcf_to_sw(valid, e.pcf())?);
                bits
            }
            (MmuVersion::V3, EntryRole::Pde) => {
                let e = v3::PdeV3::from_bits(raw);
                let aperture = pde_aperture_from_hw(e.aperture());
                let valid = aperture != Aperture::Invalid;
                let mut bits = Self {
                    valid,
                    aperture,
                    address: e.physical_address(),
                    ..Self::default()
                };
                bits.set_pde_pcf(pcf::pde_pcf_to_sw(valid, e.pcf())?);
                bits
            }
        };
        log::trace!("decode {version:?} {role:?} {raw:#018x} -> {bits:?}");
        Ok(bits)
    }

    /// Encode into a raw 64-bit entry.
    ///
    /// Fields that do not apply to the entry's state are dropped. Fields the
    /// generation cannot express at all are rejected.
    ///
    /// # Errors
    /// - [`FormatError::Unsupported`] for attributes absent from the generation.
    /// - [`FormatError::UnrepresentablePcf`] for a V3 attribute combination
    ///   with no hardware value.
    /// - [`FormatError::BadAperture`] for a peer-memory table pointer, or a
    ///   mapped PDE without an aperture.
    /// - [`FormatError::AddressOutOfRange`] if the address exceeds the field.
    pub fn encode(&self, version: MmuVersion, role: EntryRole) -> Result<u64, FormatError> {
        let raw = match (version, role) {
            (MmuVersion::V1 | MmuVersion::V2, EntryRole::Pte) => self.encode_pte_v2(version)?,
            (MmuVersion::V1 | MmuVersion::V2, EntryRole::Pde) => self.encode_pde_v2()?,
            (MmuVersion::V3, EntryRole::Pte) => self.encode_pte_v3()?,
            (MmuVersion::V3, EntryRole::Pde) => self.encode_pde_v3()?,
        };
        log::trace!("encode {version:?} {role:?} {self:?} -> {raw:#018x}");
        Ok(raw)
    }

    /// `decode(encode(self))`: the entry as hardware would read it back.
    ///
    /// # Errors
    /// Any error of [`encode`](Self::encode).
    pub fn normalized(&self, version: MmuVersion, role: EntryRole) -> Result<Self, FormatError> {
        Self::decode(version, role, self.encode(version, role)?)
    }

    fn encode_pte_v2(&self, version: MmuVersion) -> Result<u64, FormatError> {
        let unsupported = |what| FormatError::Unsupported { version, what };
        if self.atomic_disable && version == MmuVersion::V1 {
            return Err(unsupported("atomic disable"));
        }
        if self.valid && self.ace {
            return Err(unsupported("access counting"));
        }
        if !self.valid && (self.no_valid_4k || self.mapping_nowhere) {
            return Err(unsupported("extended invalid PTE states"));
        }
        check_address(self.address, v2::ADDRESS_LIMIT)?;

        let mut e = v2::PteV2::new()
            .with_valid(self.valid)
            .with_aperture(pte_aperture_to_hw(self.aperture))
            .with_vol(if self.valid { self.uncached } else { self.sparse })
            .with_privilege(self.privilege)
            .with_read_only(self.read_only)
            .with_atomic_disable(self.atomic_disable)
            .with_kind(self.kind);
        e.set_physical_address(self.address);
        Ok(e.into_bits())
    }

    fn encode_pde_v2(&self) -> Result<u64, FormatError> {
        let aperture = self.pde_aperture()?;
        check_address(self.address, v2::ADDRESS_LIMIT)?;

        let mut e = v2::PdeV2::new()
            .with_aperture(aperture)
            .with_vol(if self.valid { self.uncached } else { self.sparse });
        e.set_physical_address(self.address);
        Ok(e.into_bits())
    }

    fn encode_pte_v3(&self) -> Result<u64, FormatError> {
        if self.kind >= v3::KIND_LIMIT {
            return Err(FormatError::Unsupported {
                version: MmuVersion::V3,
                what: "kind wider than 4 bits",
            });
        }
        check_address(self.address, v3::ADDRESS_LIMIT)?;

        let hw = pcf::pte_pcf_to_hw(self.valid, self.pte_pcf().trim(self.valid))?;
        let mut e = v3::PteV3::new()
            .with_valid(self.valid)
            .with_aperture(pte_aperture_to_hw(self.aperture))
            .with_pcf(hw)
            .with_kind(self.kind);
        e.set_physical_address(self.address);
        Ok(e.into_bits())
    }

    fn encode_pde_v3(&self) -> Result<u64, FormatError> {
        let aperture = self.pde_aperture()?;
        check_address(self.address, v3::ADDRESS_LIMIT)?;

        let hw = pcf::pde_pcf_to_hw(self.valid, self.pde_pcf().trim(self.valid))?;
        let mut e = v3::PdeV3::new().with_aperture(aperture).with_pcf(hw);
        e.set_physical_address(self.address);
        Ok(e.into_bits())
    }

    /// Aperture field of a directory entry; the aperture alone decides validity.
    fn pde_aperture(&self) -> Result<u8, FormatError> {
        let aperture = if self.valid {
            self.aperture
        } else {
            Aperture::Invalid
        };
        match pde_aperture_to_hw(aperture) {
            Some(0) if self.valid => Err(FormatError::BadAperture {
                aperture,
                role: EntryRole::Pde,
            }),
            Some(v) => Ok(v),
            None => Err(FormatError::BadAperture {
                aperture,
                role: EntryRole::Pde,
            }),
        }
    }
}

/// An invalid PTE without address and aperture bits has no aperture.
const fn decode_pte_aperture(valid: bool, hw: u8, address: PhysicalAddress) -> Aperture {
    if !valid && hw == 0 && address.as_u64() == 0 {
        Aperture::Invalid
    } else {
        pte_aperture_from_hw(hw)
    }
}

const fn check_address(address: PhysicalAddress, limit: u64) -> Result<(), FormatError> {
    if address.as_u64() >= limit {
        Err(FormatError::AddressOutOfRange { address })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MmuVersion; 3] = [MmuVersion::V1, MmuVersion::V2, MmuVersion::V3];

    #[test]
    fn zero_decodes_as_unmapped() {
        for v in ALL {
            for role in [EntryRole::Pte, EntryRole::Pde] {
                let e = GmmuEntryBits::decode(v, role, 0).unwrap();
                assert_eq!(e, GmmuEntryBits::default(), "{v:?} {role:?}");
                assert_eq!(e.encode(v, role).unwrap(), 0);
            }
        }
    }

    #[test]
    fn leaf_roundtrip_on_every_generation() {
        for v in ALL {
            let e = GmmuEntryBits::leaf(Aperture::SysCoherent, PhysicalAddress::new(0x8_0000_0000))
                .with_read_only(true)
                .with_uncached(true)
                .with_kind(3);
            let raw = e.encode(v, EntryRole::Pte).unwrap();
            assert_eq!(raw & 1, 1);
            assert_eq!(GmmuEntryBits::decode(v, EntryRole::Pte, raw).unwrap(), e);
        }
    }

    #[test]
    fn v2_sparse_uses_vol_on_invalid_entries() {
        let e = GmmuEntryBits::default().with_sparse(true);
        let raw = e.encode(MmuVersion::V2, EntryRole::Pte).unwrap();
        assert_eq!(raw, 0b1000);
        let back = GmmuEntryBits::decode(MmuVersion::V2, EntryRole::Pte, raw).unwrap();
        assert!(back.sparse);
        assert!(!back.uncached);
        assert!(!back.valid);
    }

    #[test]
    fn v1_has_no_atomic_disable() {
        let e = GmmuEntryBits::leaf(Aperture::Video, PhysicalAddress::new(0x1000))
            .with_atomic_disable(true);
        assert!(matches!(
            e.encode(MmuVersion::V1, EntryRole::Pte),
            Err(FormatError::Unsupported { version: MmuVersion::V1, .. })
        ));
        let raw = e.encode(MmuVersion::V2, EntryRole::Pte).unwrap();
        assert_eq!(raw & (1 << 7), 1 << 7);
        // A stray bit 7 on V1 is reserved and ignored.
        let v1 = GmmuEntryBits::decode(MmuVersion::V1, EntryRole::Pte, raw).unwrap();
        assert!(!v1.atomic_disable);
    }

    #[test]
    fn v3_pcf_drives_attributes() {
        let raw = v3::PteV3::new().with_valid(true).with_pcf(7).into_bits();
        let e = GmmuEntryBits::decode(MmuVersion::V3, EntryRole::Pte, raw).unwrap();
        assert!(e.privilege && e.read_only && e.atomic_disable && e.uncached && e.ace);

        let bad = v3::PteV3::new().with_valid(true).with_pcf(12).into_bits();
        assert!(GmmuEntryBits::decode(MmuVersion::V3, EntryRole::Pte, bad).is_err());
    }

    #[test]
    fn normalization_drops_state_irrelevant_bits() {
        let e = GmmuEntryBits::default().with_sparse(true).with_ace(true);
        let n = e.normalized(MmuVersion::V3, EntryRole::Pte).unwrap();
        assert_eq!(n, GmmuEntryBits::default().with_sparse(true));
    }

    #[test]
    fn pde_requires_real_aperture() {
        let e = GmmuEntryBits::table(Aperture::Peer, PhysicalAddress::new(0x1000));
        assert!(matches!(
            e.encode(MmuVersion::V2, EntryRole::Pde),
            Err(FormatError::BadAperture { .. })
        ));
        let e = GmmuEntryBits::default().with_valid(true);
        assert!(e.encode(MmuVersion::V3, EntryRole::Pde).is_err());

        let e = GmmuEntryBits::table(Aperture::Video, PhysicalAddress::new(0x7000))
            .with_ats_disallowed(true);
        let raw = e.encode(MmuVersion::V3, EntryRole::Pde).unwrap();
        assert_eq!(raw & 1, 0);
        assert_eq!(GmmuEntryBits::decode(MmuVersion::V3, EntryRole::Pde, raw).unwrap(), e);
    }

    #[test]
    fn address_limits() {
        let e = GmmuEntryBits::leaf(Aperture::Video, PhysicalAddress::new(1 << 52));
        assert!(matches!(
            e.encode(MmuVersion::V3, EntryRole::Pte),
            Err(FormatError::AddressOutOfRange { .. })
        ));
        assert!(e.encode(MmuVersion::V2, EntryRole::Pte).is_ok());
    }
}
