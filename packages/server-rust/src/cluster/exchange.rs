//! Per-version exchange state machine.
//!
//! An [`ExchangeFuture`] is owned by the coordinator that created it. It
//! records which contributors are expected, merges the snapshots they send,
//! and broadcasts its [`ExchangeOutcome`] to any number of [`ExchangeWaiter`]s
//! through a `watch` channel (single writer, many readers).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use meridian_core::{ExchangeId, NodeId, PartitionSnapshot, SnapshotError, TopologyVersion};

use super::affinity::AffinityAssignment;
use super::error::ClusterError;

/// Lifecycle of an exchange. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeStatus {
    /// Created and broadcast; no contribution merged yet.
    Pending,
    /// At least one contribution merged; assignment not yet computed.
    Merging,
    /// Assignment computed and published.
    Done,
    /// Superseded by a newer exchange. A retry needs a new `ExchangeId`.
    Failed,
}

impl ExchangeStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns `true` if moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Merging | Self::Done | Self::Failed)
                | (Self::Merging, Self::Done | Self::Failed)
        )
    }
}

/// What waiters observe.
#[derive(Debug, Clone)]
pub enum ExchangeOutcome {
    Pending,
    Done(Arc<AffinityAssignment>),
    Abandoned {
        superseded_by: Option<TopologyVersion>,
    },
}

/// Result of offering a contribution to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContributionOutcome {
    /// Merged from an expected contributor.
    Accepted,
    /// Already merged; the repeat is ignored.
    Duplicate,
    /// Merged from a node that was not expected; never waited on.
    Late,
    /// Failed validation; the contributor is dropped from the wait set.
    Rejected(SnapshotError),
    /// The exchange already finished.
    Closed,
}

/// State of one exchange round.
#[derive(Debug)]
pub struct ExchangeFuture {
    id: ExchangeId,
    partition_count: u32,
    status: ExchangeStatus,
    expected: BTreeSet<NodeId>,
    received: BTreeMap<NodeId, PartitionSnapshot>,
    rejected: BTreeSet<NodeId>,
    presumed_failed: BTreeSet<NodeId>,
    result: Option<Arc<AffinityAssignment>>,
    started_at: Instant,
    deadline: Instant,
    outcome: watch::Sender<ExchangeOutcome>,
}

impl ExchangeFuture {
    /// Creates a `Pending` exchange waiting on `expected` until `timeout`.
    pub fn new(
        id: ExchangeId,
        expected: impl IntoIterator<Item = NodeId>,
        partition_count: u32,
        timeout: Duration,
    ) -> Self {
        let started_at = Instant::now();
        let (outcome, _) = watch::channel(ExchangeOutcome::Pending);
        Self {
            id,
            partition_count,
            status: ExchangeStatus::Pending,
            expected: expected.into_iter().collect(),
            received: BTreeMap::new(),
            rejected: BTreeSet::new(),
            presumed_failed: BTreeSet::new(),
            result: None,
            started_at,
            deadline: started_at + timeout,
            outcome,
        }
    }

    #[must_use]
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    #[must_use]
    pub fn version(&self) -> TopologyVersion {
        self.id.topology_version()
    }

    #[must_use]
    pub fn status(&self) -> ExchangeStatus {
        self.status
    }

    #[must_use]
    pub fn expected(&self) -> &BTreeSet<NodeId> {
        &self.expected
    }

    /// Snapshots merged so far, including late ones.
    #[must_use]
    pub fn snapshots(&self) -> &BTreeMap<NodeId, PartitionSnapshot> {
        &self.received
    }

    #[must_use]
    pub fn rejected(&self) -> &BTreeSet<NodeId> {
        &self.rejected
    }

    #[must_use]
    pub fn presumed_failed(&self) -> &BTreeSet<NodeId> {
        &self.presumed_failed
    }

    #[must_use]
    pub fn result(&self) -> Option<&Arc<AffinityAssignment>> {
        self.result.as_ref()
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Merges a contribution from `sender`.
    pub fn on_contribution(
        &mut self,
        sender: NodeId,
        snapshot: PartitionSnapshot,
    ) -> ContributionOutcome {
        if self.status.is_terminal() {
            return ContributionOutcome::Closed;
        }
        if self.received.contains_key(&sender) || self.rejected.contains(&sender) {
            return ContributionOutcome::Duplicate;
        }
        if let Err(err) = snapshot.validate(sender, self.version(), self.partition_count) {
            debug!(exchange = %self.id, node = %sender, error = %err, "rejecting contribution");
            self.expected.remove(&sender);
            self.rejected.insert(sender);
            return ContributionOutcome::Rejected(err);
        }

        let expected = self.expected.contains(&sender);
        self.received.insert(sender, snapshot);
        if self.status == ExchangeStatus::Pending {
            self.status = ExchangeStatus::Merging;
        }
        if expected {
            ContributionOutcome::Accepted
        } else {
            ContributionOutcome::Late
        }
    }

    /// Stops waiting on a node that left or failed after creation.
    ///
    /// Returns `true` if the node was still awaited.
    pub fn on_node_left(&mut self, node_id: &NodeId) -> bool {
        if self.received.contains_key(node_id) {
            self.expected.remove(node_id);
            return false;
        }
        self.expected.remove(node_id)
    }

    /// Expected contributors that have not contributed yet.
    #[must_use]
    pub fn missing(&self) -> Vec<NodeId> {
        self.expected
            .iter()
            .filter(|node| !self.received.contains_key(node))
            .copied()
            .collect()
    }

    /// Returns `true` once every still-expected node has contributed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.status.is_terminal() && self.missing().is_empty()
    }

    /// Gives up on every missing contributor and returns them.
    pub fn presume_failed(&mut self) -> Vec<NodeId> {
        let missing = self.missing();
        for node in &missing {
            self.expected.remove(node);
            self.presumed_failed.insert(*node);
        }
        missing
    }

    /// Publishes the final assignment and wakes every waiter.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::IllegalTransition`] if the exchange already
    /// finished.
    pub fn complete(
        &mut self,
        assignment: AffinityAssignment,
    ) -> Result<Arc<AffinityAssignment>, ClusterError> {
        self.transition(ExchangeStatus::Done)?;
        let assignment = Arc::new(assignment);
        self.result = Some(Arc::clone(&assignment));
        self.outcome
            .send_replace(ExchangeOutcome::Done(Arc::clone(&assignment)));
        Ok(assignment)
    }

    /// Marks the exchange superseded, drops partial state and wakes waiters
    /// with an abandonment.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::IllegalTransition`] if the exchange already
    /// finished.
    pub fn abandon(&mut self, superseded_by: Option<TopologyVersion>) -> Result<(), ClusterError> {
        self.transition(ExchangeStatus::Failed)?;
        self.received.clear();
        self.outcome
            .send_replace(ExchangeOutcome::Abandoned { superseded_by });
        Ok(())
    }

    /// Registers a waiter for this exchange's outcome.
    #[must_use]
    pub fn subscribe(&self) -> ExchangeWaiter {
        ExchangeWaiter {
            version: self.version(),
            rx: self.outcome.subscribe(),
        }
    }

    fn transition(&mut self, to: ExchangeStatus) -> Result<(), ClusterError> {
        if !self.status.can_transition_to(to) {
            return Err(ClusterError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Read-only handle that resolves when an exchange finishes.
#[derive(Debug, Clone)]
pub struct ExchangeWaiter {
    version: TopologyVersion,
    rx: watch::Receiver<ExchangeOutcome>,
}

impl ExchangeWaiter {
    #[must_use]
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    /// Waits for the exchange to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::ExchangeAbandoned`] if the exchange was
    /// superseded, or was dropped before completing.
    pub async fn wait(mut self) -> Result<Arc<AffinityAssignment>, ClusterError> {
        loop {
            let outcome = self.rx.borrow_and_update().clone();
            match outcome {
                ExchangeOutcome::Done(assignment) => return Ok(assignment),
                ExchangeOutcome::Abandoned { superseded_by } => {
                    return Err(ClusterError::ExchangeAbandoned {
                        version: self.version,
                        superseded_by,
                    })
                }
                ExchangeOutcome::Pending => {}
            }
            if self.rx.changed().await.is_err() {
                return Err(ClusterError::ExchangeAbandoned {
                    version: self.version,
                    superseded_by: None,
                });
            }
        }
    }
}
