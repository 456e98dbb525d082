//! Rebalance trigger: turns two consecutive assignments into transfer work.
//!
//! - `plan_transfers()`: diff old owners against new owners per partition
//! - `order_transfers()`: sort transfers for availability preservation
//! - `RebalanceScheduler`: the hook the coordinator calls once an exchange is
//!   `Done`; `ChannelRebalanceScheduler` forwards batches to a consumer

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use meridian_core::{NodeId, TopologyVersion};

use super::affinity::AffinityAssignment;

/// One unit of partition data movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTask {
    pub partition_id: u32,
    /// Owner that no longer holds the partition, paired with this gain.
    /// `None` when the replica set grew.
    pub losing_owner: Option<NodeId>,
    pub gaining_owner: NodeId,
    /// An owner in both assignments that can stream the data, if any.
    pub supplier: Option<NodeId>,
    /// `true` when the gaining node already held a replica of the partition.
    pub promotion: bool,
}

/// Transfers for one ready version, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceBatch {
    pub version: TopologyVersion,
    pub tasks: Vec<TransferTask>,
}

/// Plans transfers to move from `old` to `new`.
///
/// For each partition the owners that left the replica set are zipped with
/// the owners that joined it, producing one task per
/// (partition, losing owner, gaining owner). Surplus gains carry no losing
/// owner; surplus losses need no transfer. A primary swap between two
/// existing replicas is a promotion task. With no previous assignment there
/// is nothing to move.
#[must_use]
pub fn plan_transfers(
    old: Option<&AffinityAssignment>,
    new: &AffinityAssignment,
) -> Vec<TransferTask> {
    let Some(old) = old else {
        return Vec::new();
    };

    let mut tasks = Vec::new();
    for (partition_id, new_owners) in new.iter() {
        let old_owners = old.owners(partition_id);
        let supplier = old_owners
            .iter()
            .find(|node| new_owners.contains(node))
            .copied();

        let lost: Vec<NodeId> = old_owners
            .iter()
            .filter(|node| !new_owners.contains(node))
            .copied()
            .collect();
        let gained = new_owners.iter().filter(|node| !old_owners.contains(node));

        let mut lost = lost.into_iter();
        for gaining_owner in gained {
            tasks.push(TransferTask {
                partition_id,
                losing_owner: lost.next(),
                gaining_owner: *gaining_owner,
                supplier,
                promotion: false,
            });
        }

        // Backup taking over as primary without any data movement.
        if let (Some(old_primary), Some(new_primary)) = (old_owners.first(), new_owners.first()) {
            if old_primary != new_primary && old_owners.contains(new_primary) {
                tasks.push(TransferTask {
                    partition_id,
                    losing_owner: Some(*old_primary),
                    gaining_owner: *new_primary,
                    supplier: Some(*new_primary),
                    promotion: true,
                });
            }
        }
    }
    tasks
}

/// Orders transfers for availability:
/// 1. Promotions first (no data needs to move)
/// 2. Partitions with fewer surviving replicas next (most at risk)
/// 3. Then by partition id
pub fn order_transfers(tasks: &mut [TransferTask], new: &AffinityAssignment, old: &AffinityAssignment) {
    tasks.sort_by(|a, b| {
        b.promotion
            .cmp(&a.promotion)
            .then_with(|| surviving_replicas(a, old, new).cmp(&surviving_replicas(b, old, new)))
            .then_with(|| a.partition_id.cmp(&b.partition_id))
    });
}

fn surviving_replicas(task: &TransferTask, old: &AffinityAssignment, new: &AffinityAssignment) -> usize {
    let new_owners = new.owners(task.partition_id);
    old.owners(task.partition_id)
        .iter()
        .filter(|node| new_owners.contains(node))
        .count()
}

/// Receives completed assignments. Invoked only after the exchange is `Done`.
pub trait RebalanceScheduler: Send + Sync {
    fn on_assignment_ready(&self, old: Option<&AffinityAssignment>, new: &AffinityAssignment);
}

/// Plans and orders transfers, then hands the batch to a channel consumer.
#[derive(Debug, Clone)]
pub struct ChannelRebalanceScheduler {
    tx: mpsc::UnboundedSender<RebalanceBatch>,
}

impl ChannelRebalanceScheduler {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RebalanceBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RebalanceScheduler for ChannelRebalanceScheduler {
    fn on_assignment_ready(&self, old: Option<&AffinityAssignment>, new: &AffinityAssignment) {
        let mut tasks = plan_transfers(old, new);
        if let Some(old) = old {
            order_transfers(&mut tasks, new, old);
        }
        debug!(version = %new.version(), tasks = tasks.len(), "rebalance planned");
        metrics::counter!("meridian_rebalance_tasks_total").increment(tasks.len() as u64);

        let batch = RebalanceBatch {
            version: new.version(),
            tasks,
        };
        if self.tx.send(batch).is_err() {
            warn!(version = %new.version(), "rebalance consumer dropped; batch discarded");
        }
    }
}

/// Scheduler that ignores every assignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRebalanceScheduler;

impl RebalanceScheduler for NullRebalanceScheduler {
    fn on_assignment_ready(&self, _old: Option<&AffinityAssignment>, _new: &AffinityAssignment) {}
}

impl<T: RebalanceScheduler + ?Sized> RebalanceScheduler for Arc<T> {
    fn on_assignment_ready(&self, old: Option<&AffinityAssignment>, new: &AffinityAssignment) {
        (**self).on_assignment_ready(old, new);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
