//! Exchange coordinator: turns membership events into ready topology versions.
//!
//! One coordinator runs per node as a [`BackgroundRunnable`], so membership
//! events, inbound exchange messages and recalculation requests are handled
//! strictly one at a time. The oldest live member acts as master: it issues
//! an `ExchangeRequest`, merges every member's snapshot, computes the
//! assignment and broadcasts `ExchangeComplete`. Every other member adopts
//! requests, contributes its snapshot and publishes the master's result.
//!
//! A node that has not yet taken part in an exchange (fresh or restarted)
//! never acts as master. If no master contacts it within one exchange
//! timeout, the lowest-id node among the reported joiners bootstraps the
//! cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use meridian_core::{EventKind, ExchangeId, NodeId, PartitionSnapshot, TopologyVersion};

use crate::service::worker::{BackgroundRunnable, BackgroundWorker, WorkerOptions, WorkerSender};

use super::affinity::{compute_assignment, AffinityAssignment, AssignmentInput};
use super::error::ClusterError;
use super::exchange::{ContributionOutcome, ExchangeFuture, ExchangeWaiter};
use super::messages::{
    ExchangeCompletePayload, ExchangeContributionPayload, ExchangeMessage,
    ExchangeRequestPayload, InboundExchangeMessage,
};
use super::rebalance::RebalanceScheduler;
use super::state::{ReadyTopology, Route, TopologyState};
use super::store::PersistedTopology;
use super::traits::{DurabilityCheck, ExchangeTransport, PartitionStateProvider, TopologyStore};
use super::types::{ClusterConfig, MembersView, MembershipEvent};

type RecalculationReply = oneshot::Sender<Result<ExchangeWaiter, ClusterError>>;

// ---------------------------------------------------------------------------
// Inputs and collaborators
// ---------------------------------------------------------------------------

/// Everything the coordinator loop consumes.
#[derive(Debug)]
pub enum CoordinatorInput {
    /// A report from the membership/failure-detector feed.
    Membership(MembershipEvent),
    /// A protocol message from a peer.
    Inbound(InboundExchangeMessage),
    /// Recompute the assignment without a membership change.
    Recalculate {
        backup_count: u32,
        reply: RecalculationReply,
    },
}

/// Collaborators the coordinator is wired to.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub transport: Arc<dyn ExchangeTransport>,
    pub partitions: Arc<dyn PartitionStateProvider>,
    pub durability: Arc<dyn DurabilityCheck>,
    pub store: Arc<dyn TopologyStore>,
    pub rebalance: Arc<dyn RebalanceScheduler>,
}

// ---------------------------------------------------------------------------
// ExchangeCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Master,
    Follower { master: NodeId },
}

struct ActiveExchange {
    role: Role,
    future: ExchangeFuture,
    changes: Vec<MembershipEvent>,
    members: MembersView,
    backup_count: u32,
    /// Sent again whenever the same request is delivered twice.
    contribution: Option<ExchangeMessage>,
}

/// Per-node state machine of the exchange protocol.
pub struct ExchangeCoordinator {
    local: NodeId,
    config: Arc<ClusterConfig>,
    deps: CoordinatorDeps,
    state: Arc<TopologyState>,
    backup_count: u32,
    /// Highest version issued, adopted or abandoned by this node.
    highest_seen: TopologyVersion,
    /// At most one event per node, the one with the highest priority.
    pending: BTreeMap<NodeId, MembershipEvent>,
    pending_recalculation: Option<(u32, Vec<RecalculationReply>)>,
    /// Members reported lost that are still in the ready view.
    suspected: BTreeSet<NodeId>,
    active: Option<ActiveExchange>,
    /// Set once this process has completed an exchange.
    joined: bool,
    bootstrap_after: Instant,
}

impl ExchangeCoordinator {
    fn new(
        local: NodeId,
        config: Arc<ClusterConfig>,
        deps: CoordinatorDeps,
        state: Arc<TopologyState>,
        backup_count: u32,
    ) -> Self {
        let highest_seen = state.current_version();
        let bootstrap_after = Instant::now() + Duration::from_millis(config.exchange_timeout_ms);
        Self {
            local,
            config,
            deps,
            state,
            backup_count,
            highest_seen,
            pending: BTreeMap::new(),
            pending_recalculation: None,
            suspected: BTreeSet::new(),
            active: None,
            joined: false,
            bootstrap_after,
        }
    }

    fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.config.exchange_timeout_ms)
    }

    fn is_halted(&self) -> bool {
        self.state.halted().is_some()
    }

    /// Master of the ready view, skipping members reported lost.
    fn master(&self) -> Option<NodeId> {
        self.state
            .ready()
            .members
            .master_excluding(&self.suspected)
            .map(|m| m.node_id)
    }

    fn local_snapshot(&self, version: TopologyVersion) -> PartitionSnapshot {
        let partition_count = self.config.partition_count;
        PartitionSnapshot {
            node_id: self.local,
            version,
            durable: self.deps.durability.is_durable(version),
            counters: self
                .deps
                .partitions
                .local_counters()
                .into_iter()
                .filter(|(pid, _)| *pid < partition_count)
                .collect(),
        }
    }

    /// Queues `event`, keeping only the highest-priority event per node.
    fn enqueue(&mut self, event: MembershipEvent) {
        match self.pending.get(&event.node_id) {
            Some(existing) if existing.kind.priority() >= event.kind.priority() => {
                debug!(
                    node = %event.node_id,
                    kept = existing.kind.name(),
                    dropped = event.kind.name(),
                    "collapsed membership event"
                );
            }
            _ => {
                self.pending.insert(event.node_id, event);
            }
        }
    }

    async fn send(&self, to: NodeId, message: ExchangeMessage) {
        let kind = message.kind();
        if let Err(err) = self.deps.transport.send(to, message).await {
            warn!(peer = %to, kind, error = %err, "failed to send exchange message");
        }
    }

    async fn broadcast(&self, members: &MembersView, message: &ExchangeMessage) {
        for node in members.node_ids() {
            if node != self.local {
                self.send(node, message.clone()).await;
            }
        }
    }

    fn halt(&mut self, reason: String) {
        error!(node = %self.local, %reason, "halting exchange participation");
        if let Some(mut active) = self.active.take() {
            let version = active.future.version();
            let _ = active.future.abandon(None);
            self.state.abandon(version, None);
        }
        self.reject_recalculations(|| ClusterError::Halted {
            reason: reason.clone(),
        });
        self.state.halt(reason);
        metrics::counter!("meridian_coordinator_halts_total").increment(1);
    }

    fn reject_recalculations(&mut self, err: impl Fn() -> ClusterError) {
        if let Some((_, replies)) = self.pending_recalculation.take() {
            for reply in replies {
                let _ = reply.send(Err(err()));
            }
        }
    }

    // -- membership ---------------------------------------------------------

    async fn on_membership(&mut self, event: MembershipEvent) {
        if event.node_id.is_nil() {
            warn!(kind = event.kind.name(), "membership event without a node id rejected");
            metrics::counter!("meridian_membership_events_rejected_total").increment(1);
            return;
        }
        metrics::counter!("meridian_membership_events_total", "kind" => event.kind.name())
            .increment(1);
        debug!(node = %event.node_id, kind = event.kind.name(), "membership event");

        if event.kind.is_loss() {
            if event.node_id == self.local {
                self.halt(format!("membership reported this node {}", event.kind.name()));
                return;
            }
            self.suspected.insert(event.node_id);
        }
        self.enqueue(event.clone());

        if event.kind.is_loss() {
            let role = self.active.as_ref().map(|a| a.role);
            match role {
                Some(Role::Follower { master }) if master == event.node_id => {
                    self.take_over(master, false).await;
                }
                Some(Role::Master) => {
                    let member = self
                        .active
                        .as_ref()
                        .is_some_and(|active| active.members.contains(&event.node_id));
                    if member {
                        info!(node = %event.node_id, "member lost mid-exchange; reissuing");
                        let next = self.highest_seen.next_major();
                        self.supersede(Some(next));
                    }
                }
                _ => {}
            }
        }
        self.drive().await;
    }

    async fn on_recalculate(&mut self, backup_count: u32, reply: RecalculationReply) {
        let master = self.master();
        if !self.joined || master != Some(self.local) {
            let _ = reply.send(Err(ClusterError::NotCoordinator { master }));
            return;
        }
        match self.pending_recalculation.as_mut() {
            Some((count, replies)) => {
                *count = backup_count;
                replies.push(reply);
            }
            None => self.pending_recalculation = Some((backup_count, vec![reply])),
        }
        self.drive().await;
    }

    // -- master side --------------------------------------------------------

    /// Starts exchanges until one stays in flight or nothing is left to do.
    async fn drive(&mut self) {
        while self.active.is_none() && !self.is_halted() {
            if !self.try_start().await {
                break;
            }
        }
    }

    async fn try_start(&mut self) -> bool {
        if !self.joined {
            return self.try_bootstrap().await;
        }

        let ready = self.state.ready();
        self.pending.retain(|_, event| ready.members.is_affected_by(event));

        let master = self.master();
        if master != Some(self.local) {
            self.reject_recalculations(|| ClusterError::NotCoordinator { master });
            return false;
        }

        if !self.pending.is_empty() {
            let changes: Vec<MembershipEvent> =
                std::mem::take(&mut self.pending).into_values().collect();
            let Some(trigger) = trigger_of(&changes) else {
                return false;
            };
            let version = self.highest_seen.next_major();
            let members = ready.members.apply(&changes, version);
            let backup_count = self.backup_count;
            return self
                .start_master(trigger, version, changes, members, backup_count, Vec::new())
                .await;
        }

        if let Some((backup_count, replies)) = self.pending_recalculation.take() {
            let Some(last) = ready.exchange_id else {
                for reply in replies {
                    let _ = reply.send(Err(ClusterError::NotCoordinator { master }));
                }
                return false;
            };
            let version = self.highest_seen.next_minor();
            let members = MembersView::new(version, ready.members.members.clone());
            return self
                .start_master(
                    (last.node_id(), last.event()),
                    version,
                    Vec::new(),
                    members,
                    backup_count,
                    replies,
                )
                .await;
        }
        false
    }

    async fn try_bootstrap(&mut self) -> bool {
        if Instant::now() < self.bootstrap_after {
            return false;
        }
        let joiners: Vec<MembershipEvent> = self
            .pending
            .values()
            .filter(|e| e.kind == EventKind::Joined)
            .cloned()
            .collect();
        let lowest = joiners.iter().map(|e| e.node_id).min();
        if lowest != Some(self.local) {
            return false;
        }

        for event in &joiners {
            self.pending.remove(&event.node_id);
        }
        let version = self.highest_seen.next_major();
        let members = MembersView::default().apply(&joiners, version);
        info!(node = %self.local, %version, members = members.members.len(), "bootstrapping cluster");
        let backup_count = self.backup_count;
        self.start_master(
            (self.local, EventKind::Joined),
            version,
            joiners,
            members,
            backup_count,
            Vec::new(),
        )
        .await
    }

    async fn start_master(
        &mut self,
        trigger: (NodeId, EventKind),
        version: TopologyVersion,
        changes: Vec<MembershipEvent>,
        members: MembersView,
        backup_count: u32,
        replies: Vec<RecalculationReply>,
    ) -> bool {
        let id = match ExchangeId::new(trigger.0, trigger.1, version) {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "cannot identify exchange; requeueing valid changes");
                metrics::counter!("meridian_membership_events_rejected_total").increment(1);
                for reply in replies {
                    let _ = reply.send(Err(err.clone().into()));
                }
                let total = changes.len();
                let mut requeued = 0;
                for change in changes.into_iter().filter(|c| !c.node_id.is_nil()) {
                    self.enqueue(change);
                    requeued += 1;
                }
                return requeued < total;
            }
        };

        let previous_version = self.state.current_version();
        let mut future = ExchangeFuture::new(
            id,
            members.node_ids(),
            self.config.partition_count,
            self.exchange_timeout(),
        );
        for reply in replies {
            let _ = reply.send(Ok(future.subscribe()));
        }
        future.on_contribution(self.local, self.local_snapshot(version));

        self.highest_seen = self.highest_seen.max(version);
        self.state.begin(version);
        metrics::counter!("meridian_exchanges_started_total", "role" => "master").increment(1);
        info!(
            exchange = %id,
            changes = changes.len(),
            members = members.members.len(),
            backup_count,
            "starting exchange as master"
        );

        let request = ExchangeMessage::ExchangeRequest(ExchangeRequestPayload {
            exchange_id: id,
            changes: changes.clone(),
            members: members.clone(),
            previous_version,
            backup_count,
        });
        self.active = Some(ActiveExchange {
            role: Role::Master,
            future,
            changes,
            members: members.clone(),
            backup_count,
            contribution: None,
        });
        self.broadcast(&members, &request).await;

        if self.active.as_ref().is_some_and(|a| a.future.is_ready()) {
            self.finish_master(false).await;
        }
        true
    }

    async fn on_contribution(&mut self, sender: NodeId, payload: ExchangeContributionPayload) {
        let Some(active) = self.active.as_mut() else {
            debug!(node = %sender, exchange = %payload.exchange_id, "contribution with no exchange in flight");
            return;
        };
        if active.role != Role::Master || active.future.id() != payload.exchange_id {
            debug!(node = %sender, exchange = %payload.exchange_id, "stale contribution ignored");
            return;
        }
        if payload.node_id != sender {
            warn!(
                node = %sender,
                claimed = %payload.node_id,
                exchange = %payload.exchange_id,
                "contribution from a different node than it names"
            );
            metrics::counter!("meridian_contributions_rejected_total").increment(1);
            return;
        }

        match active.future.on_contribution(sender, payload.snapshot) {
            ContributionOutcome::Accepted => {
                debug!(node = %sender, exchange = %payload.exchange_id, "contribution accepted");
            }
            ContributionOutcome::Duplicate => {
                debug!(node = %sender, exchange = %payload.exchange_id, "duplicate contribution ignored");
            }
            ContributionOutcome::Late => {
                debug!(node = %sender, exchange = %payload.exchange_id, "late contribution merged");
            }
            ContributionOutcome::Rejected(err) => {
                warn!(node = %sender, exchange = %payload.exchange_id, error = %err, "contribution rejected");
                metrics::counter!("meridian_contributions_rejected_total").increment(1);
            }
            ContributionOutcome::Closed => {}
        }

        if active.future.is_ready() {
            self.finish_master(false).await;
        }
    }

    async fn finish_master(&mut self, timed_out: bool) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let id = active.future.id();
        let version = id.topology_version();

        let presumed = if timed_out {
            let missing = active.future.presume_failed();
            let err = ClusterError::ExchangeTimeout {
                version,
                missing: missing.clone(),
            };
            warn!(exchange = %id, error = %err, "presuming missing contributors failed");
            metrics::counter!("meridian_exchange_timeouts_total").increment(1);
            metrics::counter!("meridian_presumed_failures_total").increment(missing.len() as u64);
            for node in &missing {
                self.suspected.insert(*node);
                self.enqueue(MembershipEvent::failed(*node));
            }
            missing
        } else {
            Vec::new()
        };

        let previous = previous_assignment(&self.state);
        let outcome = compute_assignment(&AssignmentInput {
            version,
            members: &active.members.members,
            partition_count: self.config.partition_count,
            backup_count: active.backup_count,
            previous: previous.as_deref(),
            snapshots: active.future.snapshots(),
        });
        if let Some(warning) = outcome.warning() {
            warn!(exchange = %id, error = %warning, "assignment is degraded");
        }

        let assignment = match active.future.complete(outcome.assignment) {
            Ok(assignment) => assignment,
            Err(err) => {
                error!(exchange = %id, error = %err, "cannot complete exchange");
                return;
            }
        };

        let complete = ExchangeMessage::ExchangeComplete(ExchangeCompletePayload {
            exchange_id: id,
            members: active.members.clone(),
            assignment: (*assignment).clone(),
            presumed_failed: presumed,
        });
        self.broadcast(&active.members, &complete).await;
        self.adopt(id, active.members, assignment, previous, active.future.elapsed())
            .await;
    }

    // -- follower side ------------------------------------------------------

    async fn on_request(&mut self, sender: NodeId, request: ExchangeRequestPayload) {
        let id = request.exchange_id;
        let version = id.topology_version();
        let ready = self.state.current_version();

        if version <= ready {
            if !self.joined && !ready.is_initial() {
                let err = ClusterError::VersionRegression {
                    local: ready,
                    observed: version,
                };
                self.halt(err.to_string());
            } else {
                debug!(exchange = %id, %ready, "stale exchange request ignored");
            }
            return;
        }

        if let Some(active) = self.active.as_ref() {
            let current = active.future.id();
            if current == id {
                if let Some(contribution) = active.contribution.clone() {
                    debug!(exchange = %id, "request delivered again; resending contribution");
                    self.send(sender, contribution).await;
                }
                return;
            }
            if id < current {
                debug!(exchange = %id, current = %current, "older concurrent request ignored");
                return;
            }
            self.supersede(Some(version));
        }

        if !request.members.contains(&self.local) {
            debug!(exchange = %id, "not a member of requested topology");
            return;
        }

        self.highest_seen = self.highest_seen.max(version);
        for change in &request.changes {
            let covered = self
                .pending
                .get(&change.node_id)
                .is_some_and(|pending| pending.kind.priority() <= change.kind.priority());
            if covered {
                self.pending.remove(&change.node_id);
            }
            if change.kind.is_loss() {
                self.suspected.insert(change.node_id);
            }
        }

        let future = ExchangeFuture::new(
            id,
            std::iter::empty(),
            self.config.partition_count,
            self.exchange_timeout() * 2,
        );
        self.state.begin(version);
        metrics::counter!("meridian_exchanges_started_total", "role" => "follower").increment(1);
        info!(exchange = %id, master = %sender, "adopting exchange");

        let contribution = ExchangeMessage::ExchangeContribution(ExchangeContributionPayload {
            exchange_id: id,
            node_id: self.local,
            snapshot: self.local_snapshot(version),
        });
        self.active = Some(ActiveExchange {
            role: Role::Follower { master: sender },
            future,
            changes: request.changes,
            members: request.members,
            backup_count: request.backup_count,
            contribution: Some(contribution.clone()),
        });
        self.send(sender, contribution).await;
    }

    async fn on_complete(&mut self, payload: ExchangeCompletePayload) {
        let id = payload.exchange_id;
        let version = id.topology_version();
        if version <= self.state.current_version() {
            debug!(exchange = %id, "stale exchange result ignored");
            return;
        }
        if !payload.members.contains(&self.local) {
            self.halt(format!("excluded from membership at version {version}"));
            return;
        }

        let previous = previous_assignment(&self.state);
        let mut elapsed = Duration::ZERO;
        let current = self.active.as_ref().map(|a| a.future.id());
        let assignment = match current {
            Some(current) if current == id => {
                let Some(mut active) = self.active.take() else {
                    return;
                };
                elapsed = active.future.elapsed();
                match active.future.complete(payload.assignment) {
                    Ok(assignment) => assignment,
                    Err(err) => {
                        error!(exchange = %id, error = %err, "cannot complete exchange");
                        return;
                    }
                }
            }
            Some(current) if current < id => {
                self.supersede(Some(version));
                Arc::new(payload.assignment)
            }
            _ => Arc::new(payload.assignment),
        };

        for node in &payload.presumed_failed {
            if *node != self.local {
                self.suspected.insert(*node);
                self.enqueue(MembershipEvent::failed(*node));
            }
        }
        self.adopt(id, payload.members, assignment, previous, elapsed)
            .await;
    }

    /// Abandons the in-flight exchange and requeues its changes.
    fn supersede(&mut self, superseded_by: Option<TopologyVersion>) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let version = active.future.version();
        if let Err(err) = active.future.abandon(superseded_by) {
            debug!(%version, error = %err, "exchange already finished");
        }
        self.state.abandon(version, superseded_by);
        for change in active.changes {
            self.enqueue(change);
        }
        self.reject_recalculations(|| ClusterError::ExchangeAbandoned {
            version,
            superseded_by,
        });
        metrics::counter!("meridian_exchanges_abandoned_total").increment(1);
        info!(%version, superseded_by = ?superseded_by, "exchange abandoned");
    }

    /// Handles loss of the master of the in-flight exchange.
    ///
    /// The interrupted changes are folded, together with the master's
    /// failure, into the next exchange issued by whoever is master now. A
    /// node that is not the next master keeps the interrupted exchange until
    /// the next master's request supersedes it or `deadline_passed`.
    async fn take_over(&mut self, failed_master: NodeId, deadline_passed: bool) {
        self.suspected.insert(failed_master);
        self.enqueue(MembershipEvent::failed(failed_master));
        let next_master = self.master();
        if !deadline_passed && !(self.joined && next_master == Some(self.local)) {
            debug!(master = ?next_master, "waiting for the next master");
            return;
        }
        let Some(mut interrupted) = self.active.take() else {
            return;
        };
        let version = interrupted.future.version();
        warn!(exchange = %interrupted.future.id(), master = %failed_master, "exchange master lost");
        for change in std::mem::take(&mut interrupted.changes) {
            self.enqueue(change);
        }

        self.drive().await;

        let superseded_by = self
            .active
            .as_ref()
            .map(|a| a.future.version())
            .or_else(|| {
                let ready = self.state.current_version();
                (ready > version).then_some(ready)
            });
        let _ = interrupted.future.abandon(superseded_by);
        self.state.abandon(version, superseded_by);
        metrics::counter!("meridian_exchanges_abandoned_total").increment(1);
    }

    // -- both sides ---------------------------------------------------------

    /// Publishes a finished exchange locally.
    async fn adopt(
        &mut self,
        id: ExchangeId,
        members: MembersView,
        assignment: Arc<AffinityAssignment>,
        previous: Option<Arc<AffinityAssignment>>,
        elapsed: Duration,
    ) {
        let version = id.topology_version();
        let published = self.state.publish(ReadyTopology {
            version,
            exchange_id: Some(id),
            members: members.clone(),
            assignment: Arc::clone(&assignment),
        });
        if let Err(err) = published {
            self.halt(err.to_string());
            return;
        }

        self.highest_seen = self.highest_seen.max(version);
        self.backup_count = assignment.backup_count();
        self.joined = true;
        self.suspected.retain(|node| members.contains(node));

        self.deps
            .rebalance
            .on_assignment_ready(previous.as_deref(), &assignment);

        let persisted = PersistedTopology {
            exchange_id: id,
            members,
            assignment: (*assignment).clone(),
        };
        if let Err(err) = self.deps.store.save(&persisted).await {
            warn!(exchange = %id, error = %err, "failed to persist ready topology");
        }

        metrics::counter!("meridian_exchanges_completed_total").increment(1);
        metrics::histogram!("meridian_exchange_duration_seconds").record(elapsed.as_secs_f64());
        info!(
            exchange = %id,
            digest = %assignment.digest(),
            elapsed_ms = elapsed.as_millis() as u64,
            "topology ready"
        );
    }

    async fn check_deadlines(&mut self) {
        let now = Instant::now();
        let expired = self
            .active
            .as_ref()
            .filter(|a| a.future.is_expired(now))
            .map(|a| a.role);
        match expired {
            Some(Role::Master) => self.finish_master(true).await,
            Some(Role::Follower { master }) => {
                metrics::counter!("meridian_exchange_timeouts_total").increment(1);
                warn!(%master, "no exchange result from master; presuming it failed");
                self.take_over(master, true).await;
            }
            None => {}
        }
        self.drive().await;
    }
}

/// Highest-priority event, lowest node id among equals.
fn trigger_of(changes: &[MembershipEvent]) -> Option<(NodeId, EventKind)> {
    changes
        .iter()
        .max_by(|a, b| {
            a.kind
                .priority()
                .cmp(&b.kind.priority())
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
        .map(|e| (e.node_id, e.kind))
}

fn previous_assignment(state: &TopologyState) -> Option<Arc<AffinityAssignment>> {
    let ready = state.ready();
    (!ready.version.is_initial()).then(|| Arc::clone(&ready.assignment))
}

#[async_trait]
impl BackgroundRunnable for ExchangeCoordinator {
    type Task = CoordinatorInput;

    async fn run(&mut self, task: CoordinatorInput) {
        if let Some(reason) = self.state.halted() {
            if let CoordinatorInput::Recalculate { reply, .. } = task {
                let _ = reply.send(Err(ClusterError::Halted { reason }));
            }
            return;
        }
        match task {
            CoordinatorInput::Membership(event) => self.on_membership(event).await,
            CoordinatorInput::Inbound(InboundExchangeMessage { sender, message }) => {
                match message {
                    ExchangeMessage::ExchangeRequest(request) => {
                        self.on_request(sender, request).await;
                    }
                    ExchangeMessage::ExchangeContribution(payload) => {
                        self.on_contribution(sender, payload).await;
                    }
                    ExchangeMessage::ExchangeComplete(payload) => {
                        self.on_complete(payload).await;
                    }
                }
                self.drive().await;
            }
            CoordinatorInput::Recalculate {
                backup_count,
                reply,
            } => self.on_recalculate(backup_count, reply).await,
        }
    }

    async fn on_tick(&mut self) {
        if !self.is_halted() {
            self.check_deadlines().await;
        }
    }

    async fn shutdown(&mut self) {
        if let Some(mut active) = self.active.take() {
            let version = active.future.version();
            let _ = active.future.abandon(None);
            self.state.abandon(version, None);
        }
        self.reject_recalculations(|| ClusterError::CoordinatorStopped);
        info!(node = %self.local, "exchange coordinator stopped");
    }
}

// ---------------------------------------------------------------------------
// CoordinatorHandle / ExchangeService
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to a running coordinator and its topology state.
#[derive(Clone)]
pub struct CoordinatorHandle {
    local: NodeId,
    config: Arc<ClusterConfig>,
    state: Arc<TopologyState>,
    sender: WorkerSender<CoordinatorInput>,
}

impl CoordinatorHandle {
    #[must_use]
    pub fn local_node_id(&self) -> NodeId {
        self.local
    }

    #[must_use]
    pub fn state(&self) -> &Arc<TopologyState> {
        &self.state
    }

    #[must_use]
    pub fn current_version(&self) -> TopologyVersion {
        self.state.current_version()
    }

    #[must_use]
    pub fn assignment_for(&self, version: TopologyVersion) -> Option<Arc<AffinityAssignment>> {
        self.state.assignment_for(version)
    }

    /// See [`TopologyState::await_version`].
    ///
    /// # Errors
    ///
    /// Fails if `version` was abandoned or the node halted.
    pub async fn await_version(
        &self,
        version: TopologyVersion,
    ) -> Result<Arc<AffinityAssignment>, ClusterError> {
        self.state.await_version(version).await
    }

    /// Routes `key` using the configured consistency mode.
    ///
    /// # Errors
    ///
    /// See [`TopologyState::route`].
    pub async fn route(&self, key: &str) -> Result<Route, ClusterError> {
        self.state.route(key, self.config.consistency_mode).await
    }

    /// Reports a membership change to the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::CoordinatorStopped`] once the coordinator is gone.
    pub async fn notify(&self, event: MembershipEvent) -> Result<(), ClusterError> {
        self.submit(CoordinatorInput::Membership(event)).await
    }

    /// Hands a received protocol message to the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::CoordinatorStopped`] once the coordinator is gone.
    pub async fn deliver(&self, inbound: InboundExchangeMessage) -> Result<(), ClusterError> {
        self.submit(CoordinatorInput::Inbound(inbound)).await
    }

    /// Recomputes the assignment with `backup_count` under a minor version.
    ///
    /// Only the current master accepts this. Resolves once the exchange
    /// finishes.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::NotCoordinator`] on any node but the master.
    /// - [`ClusterError::ExchangeAbandoned`] if a membership change
    ///   superseded the recalculation.
    pub async fn request_recalculation(
        &self,
        backup_count: u32,
    ) -> Result<Arc<AffinityAssignment>, ClusterError> {
        let (reply, rx) = oneshot::channel();
        self.submit(CoordinatorInput::Recalculate {
            backup_count,
            reply,
        })
        .await?;
        let waiter = rx.await.map_err(|_| ClusterError::CoordinatorStopped)??;
        waiter.wait().await
    }

    async fn submit(&self, input: CoordinatorInput) -> Result<(), ClusterError> {
        self.sender
            .submit(input)
            .await
            .map_err(|_| ClusterError::CoordinatorStopped)
    }
}

/// A running coordinator: its worker, its inbox forwarder and a handle.
pub struct ExchangeService {
    handle: CoordinatorHandle,
    worker: BackgroundWorker<ExchangeCoordinator>,
    forwarder: Option<JoinHandle<()>>,
}

impl ExchangeService {
    /// Validates `config`, replays the stored topology and starts the
    /// coordinator loop.
    ///
    /// Messages arriving on `inbox` are forwarded into the coordinator's
    /// bounded input channel.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::InvalidConfig`] for an unusable configuration or a
    ///   transport bound to another node.
    /// - [`ClusterError::Store`] if the stored topology cannot be read.
    pub async fn start(
        local: NodeId,
        config: ClusterConfig,
        deps: CoordinatorDeps,
        inbox: Option<mpsc::UnboundedReceiver<InboundExchangeMessage>>,
    ) -> Result<Self, ClusterError> {
        config.validate()?;
        let transport_node = deps.transport.local_node_id();
        if transport_node != local {
            return Err(ClusterError::InvalidConfig(format!(
                "transport is bound to {transport_node}, not {local}"
            )));
        }
        let config = Arc::new(config);
        let state = Arc::new(TopologyState::new(
            local,
            config.partition_count,
            config.backup_count,
            config.history_size,
        ));

        let mut backup_count = config.backup_count;
        if let Some(restored) = deps.store.load().await? {
            let version = restored.version();
            info!(node = %local, %version, "replaying stored topology");
            backup_count = restored.assignment.backup_count();
            state.publish(ReadyTopology {
                version,
                exchange_id: Some(restored.exchange_id),
                members: restored.members,
                assignment: Arc::new(restored.assignment),
            })?;
        }

        let coordinator = ExchangeCoordinator::new(
            local,
            Arc::clone(&config),
            deps,
            Arc::clone(&state),
            backup_count,
        );
        let worker = BackgroundWorker::start(
            coordinator,
            WorkerOptions {
                capacity: config.event_channel_capacity,
                tick_interval: Duration::from_millis(config.tick_interval_ms),
            },
        );
        let sender = worker.sender().ok_or(ClusterError::CoordinatorStopped)?;

        let forwarder = inbox.map(|mut rx| {
            let sender = sender.clone();
            tokio::spawn(async move {
                while let Some(inbound) = rx.recv().await {
                    if sender.submit(CoordinatorInput::Inbound(inbound)).await.is_err() {
                        break;
                    }
                }
            })
        });

        Ok(Self {
            handle: CoordinatorHandle {
                local,
                config,
                state,
                sender,
            },
            worker,
            forwarder,
        })
    }

    #[must_use]
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Stops forwarding, then shuts the coordinator down.
    pub async fn stop(mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.worker.stop().await;
    }
}
