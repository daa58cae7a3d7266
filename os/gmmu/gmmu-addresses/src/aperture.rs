use core::fmt;

/// Memory a physical address points into.
///
/// Page-table entries encode the aperture in two bits; the numeric encoding
/// differs between leaf entries and directory entries and lives with the
/// entry formats. This type is the decoded, encoding-independent view.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Aperture {
    /// No memory (an invalid directory entry).
    #[default]
    Invalid,
    /// Local video memory (framebuffer).
    Video,
    /// Another GPU's video memory.
    Peer,
    /// Cache-coherent system memory.
    SysCoherent,
    /// Non-coherent system memory.
    SysNonCoherent,
}

impl Aperture {
    #[inline]
    #[must_use]
    pub const fn is_sysmem(self) -> bool {
        matches!(self, Self::SysCoherent | Self::SysNonCoherent)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Video => "vid",
            Self::Peer => "peer",
            Self::SysCoherent => "coh",
            Self::SysNonCoherent => "ncoh",
        }
    }
}

impl fmt::Debug for Aperture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical location class of a buffer's backing memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Location {
    /// On-device video memory.
    #[default]
    Fb,
    /// Coherent host memory.
    Coherent,
    /// Non-coherent host memory.
    NonCoherent,
}

impl Location {
    /// The aperture that page-table entries use to reach memory at this location.
    #[inline]
    #[must_use]
    pub const fn aperture(self) -> Aperture {
        match self {
            Self::Fb => Aperture::Video,
            Self::Coherent => Aperture::SysCoherent,
            Self::NonCoherent => Aperture::SysNonCoherent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_aperture() {
        assert_eq!(Location::Fb.aperture(), Aperture::Video);
        assert!(Location::Coherent.aperture().is_sysmem());
        assert!(Location::NonCoherent.aperture().is_sysmem());
        assert!(!Aperture::Peer.is_sysmem());
    }
}
