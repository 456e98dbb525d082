//! Cluster domain types: membership, events, and configuration.
//!
//! These types describe the exchange protocol's view of the cluster. The
//! primitive order tokens (`TopologyVersion`, `ExchangeId`) live in
//! `meridian_core` so that every component agrees on their encoding.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use meridian_core::{EventKind, NodeId, TopologyVersion, DEFAULT_PARTITION_COUNT};

use super::error::ClusterError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What a partitioned read or write does while its topology is changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsistencyMode {
    /// Suspend until the in-flight exchange is done.
    #[default]
    Block,
    /// Fail fast with `ClusterError::TopologyChanging`.
    Reject,
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

/// Information about a single live cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub node_id: NodeId,
    /// Major topology version at which the node joined. Lower is older.
    pub join_version: u64,
    /// Rack, zone or host label; replicas prefer distinct domains.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_domain: Option<String>,
}

/// A membership change reported by the membership/failure-detector feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipEvent {
    pub node_id: NodeId,
    pub kind: EventKind,
    /// Failure domain of a joining node. Ignored for other kinds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_domain: Option<String>,
}

impl MembershipEvent {
    #[must_use]
    pub fn joined(node_id: NodeId) -> Self {
        Self {
            node_id,
            kind: EventKind::Joined,
            failure_domain: None,
        }
    }

    #[must_use]
    pub fn left(node_id: NodeId) -> Self {
        Self {
            node_id,
            kind: EventKind::Left,
            failure_domain: None,
        }
    }

    #[must_use]
    pub fn failed(node_id: NodeId) -> Self {
        Self {
            node_id,
            kind: EventKind::Failed,
            failure_domain: None,
        }
    }

    /// Attaches a failure domain to a join event.
    #[must_use]
    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.failure_domain = Some(domain.into());
        self
    }
}

/// Versioned snapshot of cluster membership.
///
/// Members are kept sorted by `node_id` so the view serializes identically on
/// every node. The version is the topology version the view belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembersView {
    pub version: TopologyVersion,
    pub members: Vec<MemberInfo>,
}

impl MembersView {
    /// Builds a view, normalizing member order.
    #[must_use]
    pub fn new(version: TopologyVersion, mut members: Vec<MemberInfo>) -> Self {
        members.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        members.dedup_by(|a, b| a.node_id == b.node_id);
        Self { version, members }
    }

    /// Returns the exchange master: the oldest member not in `excluded`.
    ///
    /// Age is the `join_version`; ties are broken by `node_id`. Returns `None`
    /// when every member is excluded.
    pub fn master_excluding(&self, excluded: &BTreeSet<NodeId>) -> Option<&MemberInfo> {
        self.members
            .iter()
            .filter(|m| !excluded.contains(&m.node_id))
            .min_by(|a, b| {
                a.join_version
                    .cmp(&b.join_version)
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
    }

    /// Returns the oldest member.
    pub fn master(&self) -> Option<&MemberInfo> {
        self.master_excluding(&BTreeSet::new())
    }

    /// Returns `true` if `node_id` is a member of this view.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.get_member(node_id).is_some()
    }

    /// Finds a member by `node_id`.
    pub fn get_member(&self, node_id: &NodeId) -> Option<&MemberInfo> {
        self.members
            .binary_search_by(|m| m.node_id.cmp(node_id))
            .ok()
            .map(|idx| &self.members[idx])
    }

    /// Ids of all members, in ascending order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.node_id).collect()
    }

    /// Returns `true` if applying `event` would change membership.
    #[must_use]
    pub fn is_affected_by(&self, event: &MembershipEvent) -> bool {
        if event.kind.is_loss() {
            self.contains(&event.node_id)
        } else {
            !self.contains(&event.node_id)
        }
    }

    /// Produces the view at `version` after applying `events` in order.
    #[must_use]
    pub fn apply(&self, events: &[MembershipEvent], version: TopologyVersion) -> Self {
        let mut members = self.members.clone();
        for event in events {
            if event.kind.is_loss() {
                members.retain(|m| m.node_id != event.node_id);
            } else if !members.iter().any(|m| m.node_id == event.node_id) {
                members.push(MemberInfo {
                    node_id: event.node_id,
                    join_version: version.major,
                    failure_domain: event.failure_domain.clone(),
                });
            }
        }
        Self::new(version, members)
    }
}

/// Configuration for the exchange protocol and its failure detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub cluster_id: String,
    pub partition_count: u32,
    pub backup_count: u32,
    /// Bound on how long the master waits for contributions.
    pub exchange_timeout_ms: u64,
    /// How often the coordinator loop checks exchange deadlines.
    pub tick_interval_ms: u64,
    /// Capacity of the coordinator's bounded input channel.
    pub event_channel_capacity: usize,
    /// Number of completed assignments retained for `assignment_for`.
    pub history_size: usize,
    pub consistency_mode: ConsistencyMode,
    pub heartbeat_interval_ms: u64,
    pub phi_threshold: f64,
    pub max_sample_size: usize,
    pub min_std_dev_ms: u64,
    pub max_no_heartbeat_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            partition_count: DEFAULT_PARTITION_COUNT,
            backup_count: 1,
            exchange_timeout_ms: 10_000,
            tick_interval_ms: 100,
            event_channel_capacity: 256,
            history_size: 16,
            consistency_mode: ConsistencyMode::Block,
            heartbeat_interval_ms: 1000,
            phi_threshold: 8.0,
            max_sample_size: 200,
            min_std_dev_ms: 100,
            max_no_heartbeat_ms: 5000,
        }
    }
}

impl ClusterConfig {
    /// Parses a JSON document; absent fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidConfig`] for malformed JSON or values
    /// rejected by [`ClusterConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self, ClusterError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClusterError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the protocol cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), ClusterError> {
        let invalid = |field: &str| Err(ClusterError::InvalidConfig(format!("{field} must be positive")));
        if self.partition_count == 0 {
            return invalid("partitionCount");
        }
        if self.exchange_timeout_ms == 0 {
            return invalid("exchangeTimeoutMs");
        }
        if self.tick_interval_ms == 0 {
            return invalid("tickIntervalMs");
        }
        if self.event_channel_capacity == 0 {
            return invalid("eventChannelCapacity");
        }
        if self.history_size == 0 {
            return invalid("historySize");
        }
        if self.max_no_heartbeat_ms == 0 {
            return invalid("maxNoHeartbeatMs");
        }
        Ok(())
    }
}
