//! Exchange identifiers: the membership event behind each protocol round.
//!
//! An [`ExchangeId`] names the node whose membership changed, the kind of
//! change, and the topology version the change produces. Ids are derived from
//! the event itself, so every node that observes the same event builds the
//! same id and encodes it to the same bytes.
//!
//! # Wire format
//!
//! [`ExchangeId::to_bytes`] emits a `MsgPack` array in the field order
//! `event, node_id, version`. Event kinds travel as the numeric discovery
//! codes `10` (joined), `11` (left) and `12` (failed).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{short_id, NodeId};
use crate::version::TopologyVersion;

/// Discovery event code for a node joining.
pub const EVT_NODE_JOINED: i32 = 10;
/// Discovery event code for a node leaving gracefully.
pub const EVT_NODE_LEFT: i32 = 11;
/// Discovery event code for a node detected as failed.
pub const EVT_NODE_FAILED: i32 = 12;

/// Reasons an exchange id is rejected at construction or decode time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidExchangeId {
    #[error("exchange id requires a non-nil origin node id")]
    NilNode,
    #[error("exchange id requires a positive major version, got {0}")]
    NonPositiveVersion(TopologyVersion),
    #[error("unrecognized membership event code: {0}")]
    UnknownEvent(i32),
    #[error("malformed exchange id bytes: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Kind of membership change that triggers an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum EventKind {
    Joined,
    Left,
    Failed,
}

impl EventKind {
    /// Conflict priority: `Failed` > `Left` > `Joined`.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Joined => 1,
            Self::Left => 2,
            Self::Failed => 3,
        }
    }

    /// Returns the numeric discovery code for this kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Joined => EVT_NODE_JOINED,
            Self::Left => EVT_NODE_LEFT,
            Self::Failed => EVT_NODE_FAILED,
        }
    }

    /// Returns `true` for the kinds that remove a node (`Left`, `Failed`).
    #[must_use]
    pub const fn is_loss(self) -> bool {
        matches!(self, Self::Left | Self::Failed)
    }

    /// Upper-case name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Joined => "NODE_JOINED",
            Self::Left => "NODE_LEFT",
            Self::Failed => "NODE_FAILED",
        }
    }
}

impl TryFrom<i32> for EventKind {
    type Error = InvalidExchangeId;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            EVT_NODE_JOINED => Ok(Self::Joined),
            EVT_NODE_LEFT => Ok(Self::Left),
            EVT_NODE_FAILED => Ok(Self::Failed),
            other => Err(InvalidExchangeId::UnknownEvent(other)),
        }
    }
}

impl From<EventKind> for i32 {
    fn from(kind: EventKind) -> Self {
        kind.code()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// ExchangeId
// ---------------------------------------------------------------------------

/// Immutable identifier of one exchange round.
///
/// Equality covers all three fields. Ordering compares the topology version
/// first; ids sharing a version (two observers resolving conflicting events)
/// are ordered by event priority and then by node id, lowest node id ranking
/// highest. `a > b` therefore reads "a supersedes b", and no two distinct ids
/// compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawExchangeId", into = "RawExchangeId")]
pub struct ExchangeId {
    node_id: NodeId,
    event: EventKind,
    version: TopologyVersion,
}

/// Unvalidated wire shape of an [`ExchangeId`].
#[derive(Clone, Serialize, Deserialize)]
struct RawExchangeId {
    event: EventKind,
    node_id: NodeId,
    version: TopologyVersion,
}

impl TryFrom<RawExchangeId> for ExchangeId {
    type Error = InvalidExchangeId;

    fn try_from(raw: RawExchangeId) -> Result<Self, Self::Error> {
        Self::new(raw.node_id, raw.event, raw.version)
    }
}

impl From<ExchangeId> for RawExchangeId {
    fn from(id: ExchangeId) -> Self {
        Self {
            event: id.event,
            node_id: id.node_id,
            version: id.version,
        }
    }
}

impl ExchangeId {
    /// Builds a validated exchange id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidExchangeId::NilNode`] for a nil node id and
    /// [`InvalidExchangeId::NonPositiveVersion`] when `version.major` is 0.
    pub fn new(
        node_id: NodeId,
        event: EventKind,
        version: TopologyVersion,
    ) -> Result<Self, InvalidExchangeId> {
        if node_id.is_nil() {
            return Err(InvalidExchangeId::NilNode);
        }
        if version.major == 0 {
            return Err(InvalidExchangeId::NonPositiveVersion(version));
        }
        Ok(Self {
            node_id,
            event,
            version,
        })
    }

    /// Builds an id from a raw discovery event code.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidExchangeId::UnknownEvent`] for codes other than
    /// 10, 11 and 12, plus the validation errors of [`ExchangeId::new`].
    pub fn from_code(
        node_id: NodeId,
        code: i32,
        version: TopologyVersion,
    ) -> Result<Self, InvalidExchangeId> {
        Self::new(node_id, EventKind::try_from(code)?, version)
    }

    /// Node whose membership change triggered the exchange.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Kind of membership change.
    #[must_use]
    pub const fn event(&self) -> EventKind {
        self.event
    }

    /// Topology version this exchange produces.
    #[must_use]
    pub const fn topology_version(&self) -> TopologyVersion {
        self.version
    }

    /// Returns `true` if the exchange is for a node joining.
    #[must_use]
    pub const fn is_joined(&self) -> bool {
        matches!(self.event, EventKind::Joined)
    }

    /// Returns `true` if the exchange is for a node leaving or failing.
    #[must_use]
    pub const fn is_left(&self) -> bool {
        self.event.is_loss()
    }

    /// Id of an assignment-only recalculation within the same membership.
    #[must_use]
    pub const fn next_minor(&self) -> Self {
        Self {
            node_id: self.node_id,
            event: self.event,
            version: self.version.next_minor(),
        }
    }

    /// Returns `true` if `self` wins over `other` when both claim a round.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        self > other
    }

    /// Stable binary encoding used as the cross-node deduplication key.
    ///
    /// # Errors
    ///
    /// Returns an error only if the `MsgPack` writer fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Decodes an id produced by [`ExchangeId::to_bytes`], re-validating it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidExchangeId::Malformed`] for undecodable bytes or an id
    /// that fails validation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidExchangeId> {
        rmp_serde::from_slice(bytes).map_err(|e| InvalidExchangeId::Malformed(e.to_string()))
    }
}

impl Ord for ExchangeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.event.priority().cmp(&other.event.priority()))
            .then_with(|| other.node_id.cmp(&self.node_id))
    }
}

impl PartialOrd for ExchangeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExchangeId [version={}, node={}, event={}]",
            self.version,
            short_id(&self.node_id),
            self.event
        )
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn node(n: u128) -> NodeId {
        Uuid::from_u128(n)
    }

    fn id(n: u128, event: EventKind, major: u64) -> ExchangeId {
        ExchangeId::new(node(n), event, TopologyVersion::new(major, 0)).unwrap()
    }

    #[test]
    fn rejects_nil_node() {
        let err = ExchangeId::new(Uuid::nil(), EventKind::Joined, TopologyVersion::new(1, 0))
            .unwrap_err();
        assert_eq!(err, InvalidExchangeId::NilNode);
    }

    #[test]
    fn rejects_zero_major() {
        let err =
            ExchangeId::new(node(1), EventKind::Left, TopologyVersion::new(0, 3)).unwrap_err();
        assert_eq!(
            err,
            InvalidExchangeId::NonPositiveVersion(TopologyVersion::new(0, 3))
        );
    }

    #[test]
    fn rejects_unknown_event_code() {
        let err = ExchangeId::from_code(node(1), 42, TopologyVersion::new(1, 0)).unwrap_err();
        assert_eq!(err, InvalidExchangeId::UnknownEvent(42));
    }

    #[test]
    fn accepts_discovery_codes() {
        for (code, kind) in [
            (EVT_NODE_JOINED, EventKind::Joined),
            (EVT_NODE_LEFT, EventKind::Left),
            (EVT_NODE_FAILED, EventKind::Failed),
        ] {
            let id = ExchangeId::from_code(node(7), code, TopologyVersion::new(2, 0)).unwrap();
            assert_eq!(id.event(), kind);
        }
    }

    #[test]
    fn joined_and_left_predicates() {
        assert!(id(1, EventKind::Joined, 1).is_joined());
        assert!(!id(1, EventKind::Joined, 1).is_left());
        assert!(id(1, EventKind::Left, 1).is_left());
        assert!(id(1, EventKind::Failed, 1).is_left());
    }

    #[test]
    fn orders_by_version_first() {
        let older = id(1, EventKind::Failed, 2);
        let newer = id(9, EventKind::Joined, 3);
        assert!(older < newer);
        assert!(newer.supersedes(&older));
    }

    #[test]
    fn same_version_breaks_ties_by_priority_then_node() {
        let failed = id(5, EventKind::Failed, 4);
        let left = id(1, EventKind::Left, 4);
        assert!(failed.supersedes(&left));

        // Equal kinds: the lower node id wins.
        let low = id(1, EventKind::Failed, 4);
        let high = id(2, EventKind::Failed, 4);
        assert!(low.supersedes(&high));
        assert_ne!(low.cmp(&high), Ordering::Equal);
    }

    #[test]
    fn distinct_ids_never_compare_equal() {
        let ids = [
            id(1, EventKind::Joined, 1),
            id(1, EventKind::Left, 1),
            id(1, EventKind::Failed, 1),
            id(2, EventKind::Failed, 1),
            id(2, EventKind::Failed, 2),
        ];
        for (i, a) in ids.iter().enumerate() {
            for (j, b) in ids.iter().enumerate() {
                assert_eq!(i == j, a.cmp(b) == Ordering::Equal, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn identical_events_encode_to_identical_bytes() {
        let a = id(3, EventKind::Failed, 8);
        let b = ExchangeId::from_code(node(3), EVT_NODE_FAILED, TopologyVersion::new(8, 0))
            .unwrap();
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        assert_eq!(ExchangeId::from_bytes(&a.to_bytes().unwrap()).unwrap(), a);
    }

    #[test]
    fn decoding_revalidates() {
        #[derive(Serialize)]
        struct Forged {
            event: i32,
            node_id: Uuid,
            version: TopologyVersion,
        }
        let forged = rmp_serde::to_vec(&Forged {
            event: 99,
            node_id: node(1),
            version: TopologyVersion::new(1, 0),
        })
        .unwrap();
        assert!(matches!(
            ExchangeId::from_bytes(&forged),
            Err(InvalidExchangeId::Malformed(_))
        ));

        let zero = rmp_serde::to_vec(&Forged {
            event: EVT_NODE_JOINED,
            node_id: node(1),
            version: TopologyVersion::initial(),
        })
        .unwrap();
        assert!(ExchangeId::from_bytes(&zero).is_err());
    }

    #[test]
    fn next_minor_keeps_origin() {
        let base = id(4, EventKind::Joined, 6);
        let minor = base.next_minor();
        assert_eq!(minor.node_id(), base.node_id());
        assert_eq!(minor.event(), base.event());
        assert_eq!(minor.topology_version(), TopologyVersion::new(6, 1));
        assert!(minor.supersedes(&base));
    }

    proptest::proptest! {
        #[test]
        fn ordering_is_total_and_consistent_with_equality(
            a_node in 1u128..6,
            b_node in 1u128..6,
            a_code in 10i32..13,
            b_code in 10i32..13,
            a_major in 1u64..4,
            b_major in 1u64..4,
        ) {
            let a = ExchangeId::from_code(node(a_node), a_code, TopologyVersion::new(a_major, 0)).unwrap();
            let b = ExchangeId::from_code(node(b_node), b_code, TopologyVersion::new(b_major, 0)).unwrap();
            proptest::prop_assert_eq!(a == b, a.cmp(&b) == Ordering::Equal);
            proptest::prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            proptest::prop_assert_eq!(a == b, a.to_bytes().unwrap() == b.to_bytes().unwrap());
        }
    }
}
