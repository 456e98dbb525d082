//! Topology versions: the order token for every cluster state.
//!
//! A [`TopologyVersion`] pairs a `major` counter, advanced once per membership
//! change, with a `minor` counter, advanced for assignment-only recalculations
//! inside the same membership. Versions compare by `major`, then `minor`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Totally ordered identifier of one stable topology state.
///
/// `0.0` is reserved as the "no topology yet" sentinel returned by
/// [`TopologyVersion::initial`]; every version produced by an exchange has a
/// major component of at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TopologyVersion {
    /// Membership change counter.
    pub major: u64,
    /// Assignment-only recalculation counter within `major`.
    pub minor: u32,
}

impl TopologyVersion {
    /// Creates a version from its two components.
    #[must_use]
    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The sentinel version a node holds before any exchange completes.
    #[must_use]
    pub const fn initial() -> Self {
        Self { major: 0, minor: 0 }
    }

    /// Returns `true` for the `0.0` sentinel.
    #[must_use]
    pub const fn is_initial(&self) -> bool {
        self.major == 0 && self.minor == 0
    }

    /// The version following a membership change: `major + 1`, minor reset.
    #[must_use]
    pub const fn next_major(&self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
        }
    }

    /// The version following an assignment-only recalculation.
    #[must_use]
    pub const fn next_minor(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl Ord for TopologyVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
    }
}

impl PartialOrd for TopologyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_major_then_minor() {
        let a = TopologyVersion::new(1, 5);
        let b = TopologyVersion::new(2, 0);
        let c = TopologyVersion::new(2, 1);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_eq!(b.cmp(&TopologyVersion::new(2, 0)), Ordering::Equal);
    }

    #[test]
    fn next_major_resets_minor() {
        let v = TopologyVersion::new(3, 7).next_major();
        assert_eq!(v, TopologyVersion::new(4, 0));
    }

    #[test]
    fn next_minor_keeps_major() {
        let v = TopologyVersion::new(3, 7).next_minor();
        assert_eq!(v, TopologyVersion::new(3, 8));
        assert!(v > TopologyVersion::new(3, 7));
    }

    #[test]
    fn initial_is_smallest() {
        let initial = TopologyVersion::initial();
        assert!(initial.is_initial());
        assert!(initial < TopologyVersion::new(0, 1));
        assert!(initial < TopologyVersion::new(1, 0));
        assert!(!TopologyVersion::new(1, 0).is_initial());
    }

    #[test]
    fn display_is_dotted() {
        assert_eq!(TopologyVersion::new(12, 3).to_string(), "12.3");
    }

    proptest::proptest! {
        #[test]
        fn successors_always_increase(major in 0u64..1_000_000, minor in 0u32..1_000_000) {
            let v = TopologyVersion::new(major, minor);
            proptest::prop_assert!(v.next_minor() > v);
            proptest::prop_assert!(v.next_major() > v);
            proptest::prop_assert!(v.next_major() > v.next_minor());
        }

        #[test]
        fn ordering_matches_major_then_minor(
            a in (0u64..8, 0u32..8),
            b in (0u64..8, 0u32..8),
        ) {
            let (va, vb) = (TopologyVersion::new(a.0, a.1), TopologyVersion::new(b.0, b.1));
            proptest::prop_assert_eq!(va.cmp(&vb), a.cmp(&b));
        }
    }
}
