//! Affinity assignment: which nodes own which partition at a topology version.
//!
//! [`compute_assignment`] is a pure function of its [`AssignmentInput`]. Every
//! node feeds it the same members, previous assignment and merged snapshots,
//! so every node derives byte-identical owner lists.
//!
//! Placement is rendezvous hashing: each partition ranks the live nodes by
//! [`rendezvous_weight`] and takes owners from the top of that list. Removing
//! a node only affects partitions where it ranked high enough to be an owner,
//! so a single join or leave moves roughly `1/N` of the primaries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use meridian_core::hash::rendezvous_weight;
use meridian_core::{NodeId, PartitionSnapshot, TopologyVersion};

use super::error::ClusterError;
use super::types::MemberInfo;

/// Partition → ordered owner list (primary first) for one topology version.
///
/// Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityAssignment {
    version: TopologyVersion,
    backup_count: u32,
    partition_owners: Vec<Vec<NodeId>>,
}

impl AffinityAssignment {
    /// An assignment in which no partition has an owner.
    #[must_use]
    pub fn unassigned(version: TopologyVersion, partition_count: u32, backup_count: u32) -> Self {
        Self {
            version,
            backup_count,
            partition_owners: vec![Vec::new(); partition_count as usize],
        }
    }

    #[must_use]
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    #[must_use]
    pub fn backup_count(&self) -> u32 {
        self.backup_count
    }

    #[must_use]
    pub fn partition_count(&self) -> u32 {
        u32::try_from(self.partition_owners.len()).unwrap_or(u32::MAX)
    }

    /// Owners of `partition_id`, primary first. Empty when out of range.
    #[must_use]
    pub fn owners(&self, partition_id: u32) -> &[NodeId] {
        self.partition_owners
            .get(partition_id as usize)
            .map_or(&[][..], Vec::as_slice)
    }

    #[must_use]
    pub fn primary(&self, partition_id: u32) -> Option<NodeId> {
        self.owners(partition_id).first().copied()
    }

    #[must_use]
    pub fn backups(&self, partition_id: u32) -> &[NodeId] {
        self.owners(partition_id).get(1..).unwrap_or(&[])
    }

    /// Partitions for which `node_id` is the primary owner.
    #[must_use]
    pub fn primary_partitions(&self, node_id: &NodeId) -> Vec<u32> {
        self.iter()
            .filter(|(_, owners)| owners.first() == Some(node_id))
            .map(|(pid, _)| pid)
            .collect()
    }

    /// Partitions for which `node_id` holds any replica.
    #[must_use]
    pub fn partitions_for_node(&self, node_id: &NodeId) -> Vec<u32> {
        self.iter()
            .filter(|(_, owners)| owners.contains(node_id))
            .map(|(pid, _)| pid)
            .collect()
    }

    /// Every node that owns at least one replica.
    #[must_use]
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.partition_owners.iter().flatten().copied().collect()
    }

    /// Iterates `(partition_id, owners)` in partition order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[NodeId])> {
        (0u32..).zip(self.partition_owners.iter().map(Vec::as_slice))
    }

    /// Stable `MessagePack` encoding used for persistence and comparison.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// BLAKE3 digest (hex) over the version, backup count and owner lists.
    ///
    /// Two nodes agree on an assignment exactly when their digests match.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.major.to_le_bytes());
        hasher.update(&self.version.minor.to_le_bytes());
        hasher.update(&self.backup_count.to_le_bytes());
        for owners in &self.partition_owners {
            hasher.update(&(owners.len() as u64).to_le_bytes());
            for node in owners {
                hasher.update(node.as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Everything [`compute_assignment`] depends on.
#[derive(Debug, Clone, Copy)]
pub struct AssignmentInput<'a> {
    pub version: TopologyVersion,
    /// Live members. Order does not matter.
    pub members: &'a [MemberInfo],
    pub partition_count: u32,
    pub backup_count: u32,
    /// Assignment of the previous ready version, if any.
    pub previous: Option<&'a AffinityAssignment>,
    /// Snapshots merged by the exchange, keyed by contributor.
    pub snapshots: &'a BTreeMap<NodeId, PartitionSnapshot>,
}

/// A computed assignment plus the partitions left under-replicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentOutcome {
    pub assignment: AffinityAssignment,
    /// Partitions with fewer than `backup_count + 1` owners.
    pub degraded: Vec<u32>,
    pub available_nodes: usize,
}

impl AssignmentOutcome {
    /// `InsufficientNodes` when any partition is degraded.
    #[must_use]
    pub fn warning(&self) -> Option<ClusterError> {
        if self.degraded.is_empty() {
            return None;
        }
        Some(ClusterError::InsufficientNodes {
            required: self.assignment.backup_count as usize + 1,
            available: self.available_nodes,
            degraded: self.degraded.len(),
        })
    }
}

/// Computes the assignment for `input.version`.
///
/// Per partition:
/// 1. Rank live nodes by descending rendezvous weight (ties by node id).
/// 2. Take `backup_count + 1` owners in rank order, first one per failure
///    domain, then filling from the rest of the ranking.
/// 3. If the previous primary is gone, promote the surviving previous owner
///    with the freshest durable counter (then the better rank) to primary.
///
/// Failed nodes are simply absent from `members`, so they disappear from
/// every partition in the same version.
#[must_use]
pub fn compute_assignment(input: &AssignmentInput<'_>) -> AssignmentOutcome {
    let live: BTreeMap<NodeId, Option<&str>> = input
        .members
        .iter()
        .map(|m| (m.node_id, m.failure_domain.as_deref()))
        .collect();
    let replicas = input.backup_count as usize + 1;

    let mut partition_owners = Vec::with_capacity(input.partition_count as usize);
    let mut degraded = Vec::new();

    for pid in 0..input.partition_count {
        let ranked = rank_nodes(pid, &live);
        let mut owners = select_owners(&ranked, &live, replicas);
        if let Some(previous) = input.previous {
            promote_survivor(pid, previous, &live, input.snapshots, &mut owners);
        }
        if owners.len() < replicas {
            degraded.push(pid);
        }
        partition_owners.push(owners);
    }

    AssignmentOutcome {
        assignment: AffinityAssignment {
            version: input.version,
            backup_count: input.backup_count,
            partition_owners,
        },
        degraded,
        available_nodes: live.len(),
    }
}

fn rank_nodes(partition_id: u32, live: &BTreeMap<NodeId, Option<&str>>) -> Vec<NodeId> {
    let mut scored: Vec<(u64, NodeId)> = live
        .keys()
        .map(|node| (rendezvous_weight(partition_id, node), *node))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, node)| node).collect()
}

fn select_owners<'a>(
    ranked: &[NodeId],
    live: &BTreeMap<NodeId, Option<&'a str>>,
    replicas: usize,
) -> Vec<NodeId> {
    let mut owners: Vec<NodeId> = Vec::with_capacity(replicas.min(ranked.len()));
    let mut used_domains: BTreeSet<&'a str> = BTreeSet::new();

    for node in ranked {
        if owners.len() == replicas {
            break;
        }
        match live.get(node).copied().flatten() {
            Some(domain) => {
                if used_domains.insert(domain) {
                    owners.push(*node);
                }
            }
            None => owners.push(*node),
        }
    }
    for node in ranked {
        if owners.len() == replicas {
            break;
        }
        if !owners.contains(node) {
            owners.push(*node);
        }
    }

    owners.sort_by_key(|owner| ranked.iter().position(|n| n == owner));
    owners
}

fn promote_survivor(
    partition_id: u32,
    previous: &AffinityAssignment,
    live: &BTreeMap<NodeId, Option<&str>>,
    snapshots: &BTreeMap<NodeId, PartitionSnapshot>,
    owners: &mut Vec<NodeId>,
) {
    let previous_owners = previous.owners(partition_id);
    let Some(previous_primary) = previous_owners.first() else {
        return;
    };
    if live.contains_key(previous_primary) {
        return;
    }

    let freshness = |node: &NodeId| {
        snapshots
            .get(node)
            .and_then(|snapshot| snapshot.durable_counter(partition_id))
    };
    let survivor = owners
        .iter()
        .enumerate()
        .filter(|(_, node)| previous_owners[1..].contains(node))
        .max_by(|(rank_a, a), (rank_b, b)| {
            freshness(a)
                .cmp(&freshness(b))
                .then_with(|| rank_b.cmp(rank_a))
        })
        .map(|(rank, _)| rank);

    if let Some(rank) = survivor {
        let node = owners.remove(rank);
        owners.insert(0, node);
    }
}
