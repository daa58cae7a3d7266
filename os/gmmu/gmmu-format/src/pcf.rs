//! # Permission Control Field codec
//!
//! V3 hardware packs caching, access permissions, atomics, privilege and
//! access-counter enablement into one small integer whose meaning depends on
//! whether the entry is valid. This module translates between those hardware
//! values and a generation-independent *software PCF*, a bitmask with one bit
//! per attribute ([`SwPtePcf`], [`SwPdePcf`]).
//!
//! ## Valid PTE values
//!
//! | HW | Meaning |
//! |---:|---------|
//! | 0–8 | privileged combinations (see [`PRIVILEGED_VALID_PTE`]) |
//! | 9–15 | undefined |
//! | 16–31 | `16 + RO·8 + NO_ATOMIC·4 + UNCACHED·2 + ACE` |
//!
//! ## Invalid PTE values
//!
//! `0` plain invalid, `1` sparse, `2` mapping-nowhere, `3` no-valid-4KB-page.
//!
//! ## PDE values (3 bits)
//!
//! Valid: bit 1 uncached, bit 2 ATS-not-allowed. Invalid: bit 0 sparse,
//! bit 2 ATS-not-allowed. The remaining bit must be clear.
//!
//! Bits that do not apply to the entry's state are trimmed by
//! [`SwPtePcf::trim`]/[`SwPdePcf::trim`] before encoding; the raw encoders
//! reject them.

use crate::{EntryRole, FormatError};
use bitflags::bitflags;

bitflags! {
    /// Software view of a leaf entry's PCF.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct SwPtePcf: u32 {
        /// Invalid entry reserved as sparse (reads return zero, writes drop).
        const SPARSE = 1 << 0;
        /// Invalid 64K entry whose 4K entries must not be consulted.
        const NO_VALID_4KB_PAGE = 1 << 1;
        /// Invalid entry that faults without falling back to a smaller page.
        const MAPPING_NOWHERE = 1 << 2;
        const UNCACHED = 1 << 8;
        const READ_ONLY = 1 << 9;
        const NO_ATOMIC = 1 << 10;
        const PRIVILEGE = 1 << 11;
        /// Access counting enabled.
        const ACE = 1 << 12;
    }
}

bitflags! {
    /// Software view of a directory entry's PCF.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct SwPdePcf: u32 {
        const SPARSE = 1 << 0;
        const UNCACHED = 1 << 8;
        const ATS_NOT_ALLOWED = 1 << 16;
    }
}

impl SwPtePcf {
    /// Bits meaningful on an invalid entry.
    pub const INVALID_MASK: Self = Self::SPARSE
        .union(Self::NO_VALID_4KB_PAGE)
        .union(Self::MAPPING_NOWHERE);

    /// Bits meaningful on a valid entry.
    pub const VALID_MASK: Self = Self::UNCACHED
        .union(Self::READ_ONLY)
        .union(Self::NO_ATOMIC)
        .union(Self::PRIVILEGE)
        .union(Self::ACE);

    /// Drop bits that have no meaning for an entry in the given state.
    #[inline]
    #[must_use]
    pub const fn trim(self, valid: bool) -> Self {
        if valid {
            self.intersection(Self::VALID_MASK)
        } else {
            self.intersection(Self::INVALID_MASK)
        }
    }
}

impl SwPdePcf {
    pub const INVALID_MASK: Self = Self::SPARSE.union(Self::ATS_NOT_ALLOWED);
    pub const VALID_MASK: Self = Self::UNCACHED.union(Self::ATS_NOT_ALLOWED);

    #[inline]
    #[must_use]
    pub const fn trim(self, valid: bool) -> Self {
        if valid {
            self.intersection(Self::VALID_MASK)
        } else {
            self.intersection(Self::INVALID_MASK)
        }
    }
}

/// Hardware values `0..=8` of a valid PTE, indexed by value.
pub const PRIVILEGED_VALID_PTE: [SwPtePcf; 9] = [
    SwPtePcf::PRIVILEGE,
    SwPtePcf::PRIVILEGE.union(SwPtePcf::ACE),
    SwPtePcf::PRIVILEGE.union(SwPtePcf::UNCACHED),
    SwPtePcf::PRIVILEGE
        .union(SwPtePcf::UNCACHED)
        .union(SwPtePcf::ACE),
    SwPtePcf::PRIVILEGE
        .union(SwPtePcf::NO_ATOMIC)
        .union(SwPtePcf::UNCACHED)
        .union(SwPtePcf::ACE),
    SwPtePcf::PRIVILEGE
        .union(SwPtePcf::NO_ATOMIC)
        .union(SwPtePcf::ACE),
    SwPtePcf::PRIVILEGE
        .union(SwPtePcf::READ_ONLY)
        .union(SwPtePcf::UNCACHED)
        .union(SwPtePcf::ACE),
    SwPtePcf::PRIVILEGE
        .union(SwPtePcf::READ_ONLY)
        .union(SwPtePcf::NO_ATOMIC)
        .union(SwPtePcf::UNCACHED)
        .union(SwPtePcf::ACE),
    SwPtePcf::PRIVILEGE
        .union(SwPtePcf::READ_ONLY)
        .union(SwPtePcf::NO_ATOMIC)
        .union(SwPtePcf::ACE),
];

const REGULAR_BASE: u8 = 16;

/// Hardware values of an invalid PTE, indexed by value.
const INVALID_PTE: [SwPtePcf; 4] = [
    SwPtePcf::empty(),
    SwPtePcf::SPARSE,
    SwPtePcf::MAPPING_NOWHERE,
    SwPtePcf::NO_VALID_4KB_PAGE,
];

/// Decode a V3 PTE PCF value.
///
/// # Errors
/// [`FormatError::InvalidPcf`] for values outside the table of the entry's state.
pub fn pte_pcf_to_sw(valid: bool, hw: u8) -> Result<SwPtePcf, FormatError> {
    let invalid = FormatError::InvalidPcf {
        role: EntryRole::Pte,
        value: hw,
        valid,
    };
    if !valid {
        return INVALID_PTE.get(usize::from(hw)).copied().ok_or(invalid);
    }

    match hw {
        0..=8 => Ok(PRIVILEGED_VALID_PTE[usize::from(hw)]),
        16..=31 => {
            let v = hw - REGULAR_BASE;
            let mut sw = SwPtePcf::empty();
            sw.set(SwPtePcf::ACE, v & 0b0001 != 0);
            sw.set(SwPtePcf::UNCACHED, v & 0b0010 != 0);
            sw.set(SwPtePcf::NO_ATOMIC, v & 0b0100 != 0);
            sw.set(SwPtePcf::READ_ONLY, v & 0b1000 != 0);
            Ok(sw)
        }
        _ => Err(invalid),
    }
}

/// Encode a software PTE PCF into the V3 hardware value.
///
/// The mask must already be trimmed to the entry's state.
///
/// # Errors
/// [`FormatError::UnrepresentablePcf`] if no hardware value has exactly these bits.
pub fn pte_pcf_to_hw(valid: bool, sw: SwPtePcf) -> Result<u8, FormatError> {
    let unrepresentable = FormatError::UnrepresentablePcf {
        role: EntryRole::Pte,
        bits: sw.bits(),
        valid,
    };
    if sw.trim(valid) != sw {
        return Err(unrepresentable);
    }

    if !valid {
        return INVALID_PTE
            .iter()
            .position(|v| *v == sw)
            .and_then(|i| u8::try_from(i).ok())
            .ok_or(unrepresentable);
    }

    if sw.contains(SwPtePcf::PRIVILEGE) {
        return PRIVILEGED_VALID_PTE
            .iter()
            .position(|v| *v == sw)
            .and_then(|i| u8::try_from(i).ok())
            .ok_or(unrepresentable);
    }

    let mut v = REGULAR_BASE;
    if sw.contains(SwPtePcf::ACE) {
        v |= 0b0001;
    }
    if sw.contains(SwPtePcf::UNCACHED) {
        v |= 0b0010;
    }
    if sw.contains(SwPtePcf::NO_ATOMIC) {
        v |= 0b0100;
    }
    if sw.contains(SwPtePcf::READ_ONLY) {
        v |= 0b1000;
    }
    Ok(v)
}

const PDE_SPARSE: u8 = 1 << 0;
const PDE_UNCACHED: u8 = 1 << 1;
const PDE_ATS_NOT_ALLOWED: u8 = 1 << 2;

/// Decode a V3 PDE PCF value.
///
/// # Errors
/// [`FormatError::InvalidPcf`] if the bit that does not belong to the entry's
/// state is set, or the value exceeds three bits.
pub fn pde_pcf_to_sw(valid: bool, hw: u8) -> Result<SwPdePcf, FormatError> {
    let forbidden = if valid { PDE_SPARSE } else { PDE_UNCACHED };
    if hw > 0b111 || hw & forbidden != 0 {
        return Err(FormatError::InvalidPcf {
            role: EntryRole::Pde,
            value: hw,
            valid,
        });
    }

    let mut sw = SwPdePcf::empty();
    sw.set(SwPdePcf::ATS_NOT_ALLOWED, hw & PDE_ATS_NOT_ALLOWED != 0);
    if valid {
        sw.set(SwPdePcf::UNCACHED, hw & PDE_UNCACHED != 0);
    } else {
        sw.set(SwPdePcf::SPARSE, hw & PDE_SPARSE != 0);
    }
    Ok(sw)
}

/// Encode a software PDE PCF into the V3 hardware value.
///
/// # Errors
/// [`FormatError::UnrepresentablePcf`] if `sw` carries bits of the other state.
pub fn pde_pcf_to_hw(valid: bool, sw: SwPdePcf) -> Result<u8, FormatError> {
    if sw.trim(valid) != sw {
        return Err(FormatError::UnrepresentablePcf {
            role: EntryRole::Pde,
            bits: sw.bits(),
            valid,
        });
    }

    let mut v = 0;
    if sw.contains(SwPdePcf::ATS_NOT_ALLOWED) {
        v |= PDE_ATS_NOT_ALLOWED;
    }
    if sw.contains(SwPdePcf::UNCACHED) {
        v |= PDE_UNCACHED;
    }
    if sw.contains(SwPdePcf::SPARSE) {
        v |= PDE_SPARSE;
    }
    Ok(v)
}

/// One boolean attribute addressable in a PCF request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PcfBit {
    Sparse,
    NoValid4kPage,
    MappingNowhere,
    Uncached,
    ReadOnly,
    NoAtomic,
    Privilege,
    Ace,
    AtsNotAllowed,
}

impl PcfBit {
    pub const ALL: [Self; 9] = [
        Self::Sparse,
        Self::NoValid4kPage,
        Self::MappingNowhere,
        Self::Uncached,
        Self::ReadOnly,
        Self::NoAtomic,
        Self::Privilege,
        Self::Ace,
        Self::AtsNotAllowed,
    ];

    /// The PTE mask bit, if the attribute exists on leaf entries.
    #[must_use]
    pub const fn pte_mask(self) -> SwPtePcf {
        match self {
            Self::Sparse => SwPtePcf::SPARSE,
            Self::NoValid4kPage => SwPtePcf::NO_VALID_4KB_PAGE,
            Self::MappingNowhere => SwPtePcf::MAPPING_NOWHERE,
            Self::Uncached => SwPtePcf::UNCACHED,
            Self::ReadOnly => SwPtePcf::READ_ONLY,
            Self::NoAtomic => SwPtePcf::NO_ATOMIC,
            Self::Privilege => SwPtePcf::PRIVILEGE,
            Self::Ace => SwPtePcf::ACE,
            Self::AtsNotAllowed => SwPtePcf::empty(),
        }
    }

    /// The PDE mask bit, if the attribute exists on directory entries.
    #[must_use]
    pub const fn pde_mask(self) -> SwPdePcf {
        match self {
            Self::Sparse => SwPdePcf::SPARSE,
            Self::Uncached => SwPdePcf::UNCACHED,
            Self::AtsNotAllowed => SwPdePcf::ATS_NOT_ALLOWED,
            _ => SwPdePcf::empty(),
        }
    }

    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// A sparse set of attribute overrides applied on top of a base PCF.
///
/// ```rust
/// # use gmmu_format::{PcfBit, SwPtePcf};
/// # use gmmu_format::pcf::PcfRequest;
/// let req = PcfRequest::new()
///     .with(PcfBit::Sparse, true)
///     .with(PcfBit::Ace, true);
/// let sw = req.apply_pte(SwPtePcf::empty()).trim(false);
/// assert_eq!(sw, SwPtePcf::SPARSE);
/// ```
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PcfRequest {
    set: u16,
    clear: u16,
}

impl PcfRequest {
    #[must_use]
    pub const fn new() -> Self {
        Self { set: 0, clear: 0 }
    }

    /// Request `bit` to be `value`, replacing an earlier request for it.
    #[must_use]
    pub const fn with(mut self, bit: PcfBit, value: bool) -> Self {
        self.set_bit(bit, value);
        self
    }

    pub const fn set_bit(&mut self, bit: PcfBit, value: bool) {
        if value {
            self.set |= bit.bit();
            self.clear &= !bit.bit();
        } else {
            self.clear |= bit.bit();
            self.set &= !bit.bit();
        }
    }

    #[must_use]
    pub const fn get(&self, bit: PcfBit) -> Option<bool> {
        if self.set & bit.bit() != 0 {
            Some(true)
        } else if self.clear & bit.bit() != 0 {
            Some(false)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.set == 0 && self.clear == 0
    }

    /// Overrides in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = (PcfBit, bool)> + '_ {
        PcfBit::ALL
            .into_iter()
            .filter_map(|b| self.get(b).map(|v| (b, v)))
    }

    #[must_use]
    pub fn apply_pte(&self, base: SwPtePcf) -> SwPtePcf {
        self.iter().fold(base, |mut acc, (bit, value)| {
            acc.set(bit.pte_mask(), value);
            acc
        })
    }

    #[must_use]
    pub fn apply_pde(&self, base: SwPdePcf) -> SwPdePcf {
        self.iter().fold(base, |mut acc, (bit, value)| {
            acc.set(bit.pde_mask(), value);
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_pte_roundtrip_all_defined_values() {
        for hw in (0u8..=8).chain(16..=31) {
            let sw = pte_pcf_to_sw(true, hw).unwrap();
            assert_eq!(pte_pcf_to_hw(true, sw).unwrap(), hw, "hw value {hw}");
        }
    }

    #[test]
    fn undefined_values_are_rejected() {
        for hw in 9u8..=15 {
            assert!(matches!(
                pte_pcf_to_sw(true, hw),
                Err(FormatError::InvalidPcf { valid: true, .. })
            ));
        }
        for hw in 32u8..=u8::MAX {
            assert!(pte_pcf_to_sw(true, hw).is_err());
        }
        for hw in 4u8..=u8::MAX {
            assert!(pte_pcf_to_sw(false, hw).is_err());
        }
    }

    #[test]
    fn invalid_pte_states() {
        assert_eq!(pte_pcf_to_sw(false, 0).unwrap(), SwPtePcf::empty());
        assert_eq!(pte_pcf_to_sw(false, 1).unwrap(), SwPtePcf::SPARSE);
        assert_eq!(pte_pcf_to_sw(false, 2).unwrap(), SwPtePcf::MAPPING_NOWHERE);
        assert_eq!(pte_pcf_to_sw(false, 3).unwrap(), SwPtePcf::NO_VALID_4KB_PAGE);
        for hw in 0u8..=3 {
            let sw = pte_pcf_to_sw(false, hw).unwrap();
            assert_eq!(pte_pcf_to_hw(false, sw).unwrap(), hw);
        }
    }

    #[test]
    fn privileged_without_ace_needs_cached_atomic() {
        // Only the first two cached/atomic privileged values lack ACE.
        let sw = SwPtePcf::PRIVILEGE | SwPtePcf::NO_ATOMIC;
        assert!(matches!(
            pte_pcf_to_hw(true, sw),
            Err(FormatError::UnrepresentablePcf { .. })
        ));
        assert_eq!(
            pte_pcf_to_hw(true, SwPtePcf::PRIVILEGE | SwPtePcf::UNCACHED).unwrap(),
            2
        );
    }

    #[test]
    fn regular_values() {
        assert_eq!(pte_pcf_to_hw(true, SwPtePcf::empty()).unwrap(), 16);
        assert_eq!(
            pte_pcf_to_hw(true, SwPtePcf::READ_ONLY | SwPtePcf::ACE).unwrap(),
            25
        );
        let all_but_privilege = SwPtePcf::VALID_MASK.difference(SwPtePcf::PRIVILEGE);
        assert_eq!(pte_pcf_to_hw(true, all_but_privilege).unwrap(), 31);
    }

    #[test]
    fn untrimmed_masks_are_rejected() {
        assert!(pte_pcf_to_hw(false, SwPtePcf::SPARSE | SwPtePcf::ACE).is_err());
        assert!(pte_pcf_to_hw(true, SwPtePcf::SPARSE).is_err());
        assert!(pte_pcf_to_hw(false, SwPtePcf::SPARSE | SwPtePcf::MAPPING_NOWHERE).is_err());
    }

    #[test]
    fn sparse_with_ace_trims_to_sparse() {
        let sw = PcfRequest::new()
            .with(PcfBit::Sparse, true)
            .with(PcfBit::Ace, true)
            .apply_pte(SwPtePcf::empty())
            .trim(false);
        assert_eq!(pte_pcf_to_hw(false, sw).unwrap(), 1);
    }

    #[test]
    fn pde_roundtrip_and_rejects() {
        for valid in [true, false] {
            for hw in 0u8..=7 {
                match pde_pcf_to_sw(valid, hw) {
                    Ok(sw) => assert_eq!(pde_pcf_to_hw(valid, sw).unwrap(), hw),
                    Err(_) => {
                        let forbidden = if valid { 1 } else { 2 };
                        assert_ne!(hw & forbidden, 0);
                    }
                }
            }
            assert!(pde_pcf_to_sw(valid, 8).is_err());
        }
        assert_eq!(
            pde_pcf_to_sw(true, 0b110).unwrap(),
            SwPdePcf::UNCACHED | SwPdePcf::ATS_NOT_ALLOWED
        );
        assert_eq!(
            pde_pcf_to_sw(false, 0b101).unwrap(),
            SwPdePcf::SPARSE | SwPdePcf::ATS_NOT_ALLOWED
        );
    }

    #[test]
    fn request_last_write_wins() {
        let mut req = PcfRequest::new().with(PcfBit::ReadOnly, true);
        req.set_bit(PcfBit::ReadOnly, false);
        assert_eq!(req.get(PcfBit::ReadOnly), Some(false));
        assert_eq!(req.get(PcfBit::Ace), None);
        assert_eq!(
            req.apply_pte(SwPtePcf::READ_ONLY | SwPtePcf::ACE),
            SwPtePcf::ACE
        );
        assert_eq!(req.apply_pde(SwPdePcf::UNCACHED), SwPdePcf::UNCACHED);
    }
}
