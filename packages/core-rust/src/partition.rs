//! Partition routing and per-node partition-state snapshots.
//!
//! - [`DEFAULT_PARTITION_COUNT`]: default number of partitions (271, a prime)
//! - [`hash_to_partition`]: maps a key to a partition id in `[0, partition_count)`
//! - [`PartitionSnapshot`]: the local partition state a node contributes to an
//!   exchange, used to break ties when promoting a new primary

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::fnv1a_64;
use crate::types::NodeId;
use crate::version::TopologyVersion;

/// Default partition count. A prime chosen for uniform modulo distribution.
pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Compute the partition id for a key.
///
/// Returns 0 when `partition_count` is 0 so callers never divide by zero;
/// configuration validation rejects that value upstream.
///
/// # Examples
///
/// ```
/// use meridian_core::partition::hash_to_partition;
///
/// assert_eq!(hash_to_partition("hello", 271), 57);
/// assert_eq!(hash_to_partition("key1", 1024), 903);
/// ```
#[must_use]
pub fn hash_to_partition(key: &str, partition_count: u32) -> u32 {
    if partition_count == 0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation)]
    let pid = (fnv1a_64(key.as_bytes()) % u64::from(partition_count)) as u32;
    pid
}

/// Why a contributed snapshot was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot claims node {claimed} but was sent by {sender}")]
    NodeMismatch { claimed: NodeId, sender: NodeId },
    #[error("snapshot is for version {got}, exchange is {expected}")]
    VersionMismatch {
        expected: TopologyVersion,
        got: TopologyVersion,
    },
    #[error("snapshot references partition {partition_id} outside 0..{partition_count}")]
    PartitionOutOfRange {
        partition_id: u32,
        partition_count: u32,
    },
}

/// A node's view of its locally held partitions for one exchange.
///
/// `counters` maps each locally held partition to its update counter; a
/// higher counter means fresher data. `durable` records whether the node's
/// write-ahead log confirmed these partitions durable before reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSnapshot {
    pub node_id: NodeId,
    pub version: TopologyVersion,
    pub durable: bool,
    pub counters: BTreeMap<u32, u64>,
}

impl PartitionSnapshot {
    /// Creates an empty, durable snapshot (a node holding no partitions).
    #[must_use]
    pub fn empty(node_id: NodeId, version: TopologyVersion) -> Self {
        Self {
            node_id,
            version,
            durable: true,
            counters: BTreeMap::new(),
        }
    }

    /// Update counter for a partition, if the node holds it.
    #[must_use]
    pub fn counter(&self, partition_id: u32) -> Option<u64> {
        self.counters.get(&partition_id).copied()
    }

    /// Counter usable for promotion tie-breaks: only durable snapshots count.
    #[must_use]
    pub fn durable_counter(&self, partition_id: u32) -> Option<u64> {
        if self.durable {
            self.counter(partition_id)
        } else {
            None
        }
    }

    /// Checks that the snapshot belongs to `sender` and to the exchange at
    /// `version`, and only names partitions below `partition_count`.
    ///
    /// # Errors
    ///
    /// Returns the first [`SnapshotError`] found.
    pub fn validate(
        &self,
        sender: NodeId,
        version: TopologyVersion,
        partition_count: u32,
    ) -> Result<(), SnapshotError> {
        if self.node_id != sender {
            return Err(SnapshotError::NodeMismatch {
                claimed: self.node_id,
                sender,
            });
        }
        if self.version != version {
            return Err(SnapshotError::VersionMismatch {
                expected: version,
                got: self.version,
            });
        }
        // BTreeMap keys are sorted, so the last key is the largest.
        if let Some((&partition_id, _)) = self.counters.last_key_value() {
            if partition_id >= partition_count {
                return Err(SnapshotError::PartitionOutOfRange {
                    partition_id,
                    partition_count,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn snapshot(counters: &[(u32, u64)]) -> PartitionSnapshot {
        PartitionSnapshot {
            node_id: Uuid::from_u128(1),
            version: TopologyVersion::new(2, 0),
            durable: true,
            counters: counters.iter().copied().collect(),
        }
    }

    #[test]
    fn hash_to_partition_known_values() {
        assert_eq!(hash_to_partition("hello", 271), 57);
        assert_eq!(hash_to_partition("key1", 271), 208);
        assert_eq!(hash_to_partition("hello", 1024), 267);
    }

    #[test]
    fn hash_to_partition_stays_in_range() {
        for i in 0..1000 {
            let pid = hash_to_partition(&format!("key-{i}"), DEFAULT_PARTITION_COUNT);
            assert!(pid < DEFAULT_PARTITION_COUNT);
        }
    }

    #[test]
    fn hash_to_partition_zero_count() {
        assert_eq!(hash_to_partition("anything", 0), 0);
    }

    #[test]
    fn validate_accepts_well_formed_snapshot() {
        let snap = snapshot(&[(0, 10), (3, 4)]);
        assert!(snap
            .validate(Uuid::from_u128(1), TopologyVersion::new(2, 0), 4)
            .is_ok());
    }

    #[test]
    fn validate_rejects_foreign_sender() {
        let snap = snapshot(&[]);
        let err = snap
            .validate(Uuid::from_u128(2), TopologyVersion::new(2, 0), 4)
            .unwrap_err();
        assert!(matches!(err, SnapshotError::NodeMismatch { .. }));
    }

    #[test]
    fn validate_rejects_wrong_version() {
        let snap = snapshot(&[]);
        let err = snap
            .validate(Uuid::from_u128(1), TopologyVersion::new(3, 0), 4)
            .unwrap_err();
        assert!(matches!(err, SnapshotError::VersionMismatch { .. }));
    }

    #[test]
    fn validate_rejects_out_of_range_partition() {
        let snap = snapshot(&[(1, 1), (4, 1)]);
        let err = snap
            .validate(Uuid::from_u128(1), TopologyVersion::new(2, 0), 4)
            .unwrap_err();
        assert_eq!(
            err,
            SnapshotError::PartitionOutOfRange {
                partition_id: 4,
                partition_count: 4
            }
        );
    }

    #[test]
    fn non_durable_counters_are_ignored_for_tie_breaks() {
        let mut snap = snapshot(&[(0, 10)]);
        assert_eq!(snap.durable_counter(0), Some(10));
        snap.durable = false;
        assert_eq!(snap.counter(0), Some(10));
        assert_eq!(snap.durable_counter(0), None);
    }
}
