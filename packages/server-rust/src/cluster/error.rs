//! Error taxonomy of the exchange protocol.
//!
//! Nothing here is fatal to the process. `InsufficientNodes` is a warning
//! attached to a degraded assignment, `ExchangeTimeout` never leaves the
//! coordinator (it becomes a presumed-failure follow-up), and
//! `VersionRegression` / `Halted` stop only the local node's participation.

use meridian_core::{InvalidExchangeId, NodeId, TopologyVersion};

use super::exchange::ExchangeStatus;

/// Errors produced by the cluster exchange layer.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    InvalidExchangeId(#[from] InvalidExchangeId),

    #[error("insufficient nodes: {available} live, {required} required per partition, {degraded} partitions degraded")]
    InsufficientNodes {
        required: usize,
        available: usize,
        degraded: usize,
    },

    #[error("exchange for version {version} was abandoned; retry against a newer version")]
    ExchangeAbandoned {
        version: TopologyVersion,
        superseded_by: Option<TopologyVersion>,
    },

    #[error("exchange {version} timed out waiting for {count} contributors", count = .missing.len())]
    ExchangeTimeout {
        version: TopologyVersion,
        missing: Vec<NodeId>,
    },

    #[error("topology is changing to {version}; operation rejected")]
    TopologyChanging { version: TopologyVersion },

    #[error("version regression: local state is at {local}, cluster reports {observed}")]
    VersionRegression {
        local: TopologyVersion,
        observed: TopologyVersion,
    },

    #[error("illegal exchange transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ExchangeStatus,
        to: ExchangeStatus,
    },

    #[error("this node is not the exchange coordinator")]
    NotCoordinator { master: Option<NodeId> },

    #[error("node halted its exchange participation: {reason}")]
    Halted { reason: String },

    #[error("invalid cluster configuration: {0}")]
    InvalidConfig(String),

    #[error("exchange coordinator is not running")]
    CoordinatorStopped,

    #[error("topology store error: {0}")]
    Store(#[from] anyhow::Error),
}
