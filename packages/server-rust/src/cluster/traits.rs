//! Collaborator contracts of the exchange protocol.
//!
//! Defines the seams between the coordinator and the rest of a node:
//! `ExchangeTransport`, `PartitionStateProvider`, `DurabilityCheck`,
//! `TopologyStore`, and `FailureDetector`. Implementations live in
//! `transport`, `partition_state`, `store`, and `failure_detector`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use meridian_core::{NodeId, TopologyVersion};

use super::messages::ExchangeMessage;
use super::store::PersistedTopology;

// ---------------------------------------------------------------------------
// ExchangeTransport
// ---------------------------------------------------------------------------

/// Delivers exchange messages to peers.
///
/// Delivery may be unordered or duplicated; the coordinator tolerates both.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    /// Node this transport sends on behalf of.
    fn local_node_id(&self) -> NodeId;

    /// Sends `message` to `to`. Errors are logged, never retried here.
    async fn send(&self, to: NodeId, message: ExchangeMessage) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// PartitionStateProvider / DurabilityCheck
// ---------------------------------------------------------------------------

/// Exposes the update counters of locally held partitions.
pub trait PartitionStateProvider: Send + Sync {
    /// Partition id → update counter for every partition held locally.
    fn local_counters(&self) -> BTreeMap<u32, u64>;
}

/// Answers "is local partition state durable as of `version`".
///
/// Backed by the node's write-ahead log in a full deployment.
pub trait DurabilityCheck: Send + Sync {
    fn is_durable(&self, version: TopologyVersion) -> bool;
}

impl<T: PartitionStateProvider + ?Sized> PartitionStateProvider for Arc<T> {
    fn local_counters(&self) -> BTreeMap<u32, u64> {
        (**self).local_counters()
    }
}

impl<T: DurabilityCheck + ?Sized> DurabilityCheck for Arc<T> {
    fn is_durable(&self, version: TopologyVersion) -> bool {
        (**self).is_durable(version)
    }
}

// ---------------------------------------------------------------------------
// TopologyStore
// ---------------------------------------------------------------------------

/// Persists the last ready topology so a restarted node never regresses.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Loads the last saved topology, if any.
    async fn load(&self) -> anyhow::Result<Option<PersistedTopology>>;

    /// Replaces the saved topology.
    async fn save(&self, topology: &PersistedTopology) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// FailureDetector
// ---------------------------------------------------------------------------

/// Pluggable failure detection (e.g., phi-accrual).
///
/// Tracks heartbeat arrivals and computes suspicion levels. The phi-accrual
/// implementation uses configurable thresholds from `ClusterConfig`.
pub trait FailureDetector: Send + Sync {
    /// Records a heartbeat arrival from a node.
    fn heartbeat(&self, node_id: &NodeId, timestamp_ms: u64);

    /// Returns `true` if the node is considered alive at the given timestamp.
    fn is_alive(&self, node_id: &NodeId, timestamp_ms: u64) -> bool;

    /// Returns the timestamp (ms) of the most recent heartbeat from a node.
    fn last_heartbeat(&self, node_id: &NodeId) -> Option<u64>;

    /// Returns the current suspicion level for a node.
    /// Higher values indicate greater suspicion of failure.
    fn suspicion_level(&self, node_id: &NodeId, timestamp_ms: u64) -> f64;

    /// Removes all tracking state for a node.
    fn remove(&self, node_id: &NodeId);

    /// Resets all failure detection state.
    fn reset(&self);
}
