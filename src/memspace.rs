//! Memory-space bitmask: disambiguates overlapping virtual-address
//! mappings by exception level and security state (spec.md §3, §4.6).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Security state of the PE at the moment an address was traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SecurityState {
    NonSecure,
    Secure,
    Realm,
    Root,
}

/// Exception level of the PE at the moment an address was traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExceptionLevel {
    El0,
    El1,
    El2,
    El3,
}

/// A bitmask over the fine-grained (EL, security-state) combinations plus
/// the coarser Secure/Non-secure/Realm groupings. Manual bit constants
/// rather than the `bitflags` crate: no retrieved example in this
/// lineage's pack reaches for `bitflags`, and the mask is small and
/// fixed, so the lineage's usual manual-shift style (as in
/// `Decoder::extract_timestamp`) is a closer match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemorySpace(pub u16);

impl MemorySpace {
    pub const EL1N: MemorySpace = MemorySpace(1 << 0);
    pub const EL1S: MemorySpace = MemorySpace(1 << 1);
    pub const EL2: MemorySpace = MemorySpace(1 << 2);
    pub const EL2S: MemorySpace = MemorySpace(1 << 3);
    pub const EL3: MemorySpace = MemorySpace(1 << 4);
    pub const EL1R: MemorySpace = MemorySpace(1 << 5);
    pub const EL2R: MemorySpace = MemorySpace(1 << 6);
    pub const ROOT: MemorySpace = MemorySpace(1 << 7);

    pub const NON_SECURE: MemorySpace = MemorySpace(Self::EL1N.0 | Self::EL2.0);
    pub const SECURE: MemorySpace = MemorySpace(Self::EL1S.0 | Self::EL2S.0 | Self::EL3.0);
    pub const REALM: MemorySpace = MemorySpace(Self::EL1R.0 | Self::EL2R.0);

    pub const ANY: MemorySpace = MemorySpace(
        Self::NON_SECURE.0 | Self::SECURE.0 | Self::REALM.0 | Self::ROOT.0,
    );

    pub const fn union(self, other: MemorySpace) -> MemorySpace {
        MemorySpace(self.0 | other.0)
    }

    pub fn intersects(self, other: MemorySpace) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, other: MemorySpace) -> bool {
        self.0 & other.0 == other.0
    }

    /// Number of set bits; used by the mapper's most-specific-match
    /// lookup policy (fewer bits set wins when several accessors match).
    pub fn specificity(self) -> u32 {
        self.0.count_ones()
    }

    pub fn from_context(state: SecurityState, el: ExceptionLevel) -> MemorySpace {
        match (state, el) {
            (SecurityState::NonSecure, _) => MemorySpace::EL1N,
            (SecurityState::Secure, ExceptionLevel::El3) => MemorySpace::EL3,
            (SecurityState::Secure, _) => MemorySpace::EL1S,
            (SecurityState::Realm, ExceptionLevel::El2) => MemorySpace::EL2R,
            (SecurityState::Realm, _) => MemorySpace::EL1R,
            (SecurityState::Root, _) => MemorySpace::ROOT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarse_groups_disjoint_from_realm() {
        assert!(!MemorySpace::SECURE.intersects(MemorySpace::REALM));
        assert!(!MemorySpace::NON_SECURE.intersects(MemorySpace::SECURE));
    }

    #[test]
    fn any_contains_every_fine_mask() {
        for m in [
            MemorySpace::EL1N,
            MemorySpace::EL1S,
            MemorySpace::EL2,
            MemorySpace::EL2S,
            MemorySpace::EL3,
            MemorySpace::EL1R,
            MemorySpace::EL2R,
            MemorySpace::ROOT,
        ] {
            assert!(MemorySpace::ANY.contains(m));
        }
    }

    #[test]
    fn specificity_counts_bits() {
        assert_eq!(MemorySpace::EL1N.specificity(), 1);
        assert_eq!(MemorySpace::SECURE.specificity(), 3);
    }
}
