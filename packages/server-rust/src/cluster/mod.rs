//! Cluster exchange protocol.
//!
//! Provides domain types, collaborator traits, wire messages, the exchange
//! future, the locally shared topology state, the affinity function, the
//! rebalance hand-off and the coordinator that drives them, plus in-process
//! and `redb`-backed implementations of the collaborators.

pub mod affinity;
pub mod coordinator;
pub mod error;
pub mod exchange;
pub mod failure_detector;
pub mod messages;
pub mod partition_state;
pub mod rebalance;
pub mod state;
pub mod store;
pub mod traits;
pub mod transport;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports: flat public API
// ---------------------------------------------------------------------------

// types
pub use types::{ClusterConfig, ConsistencyMode, MemberInfo, MembersView, MembershipEvent};

// errors
pub use error::ClusterError;

// traits
pub use traits::{
    DurabilityCheck, ExchangeTransport, FailureDetector, PartitionStateProvider, TopologyStore,
};

// messages
pub use messages::{
    ExchangeCompletePayload, ExchangeContributionPayload, ExchangeMessage,
    ExchangeRequestPayload, InboundExchangeMessage,
};

// exchange
pub use exchange::{ContributionOutcome, ExchangeFuture, ExchangeOutcome, ExchangeStatus, ExchangeWaiter};

// state
pub use state::{ReadyTopology, Route, TopologyState};

// affinity
pub use affinity::{compute_assignment, AffinityAssignment, AssignmentInput, AssignmentOutcome};

// rebalance
pub use rebalance::{
    order_transfers, plan_transfers, ChannelRebalanceScheduler, NullRebalanceScheduler,
    RebalanceBatch, RebalanceScheduler, TransferTask,
};

// coordinator
pub use coordinator::{CoordinatorDeps, CoordinatorHandle, CoordinatorInput, ExchangeService};

// collaborators
pub use failure_detector::{
    DeadlineFailureDetector, HeartbeatMonitor, PhiAccrualConfig, PhiAccrualFailureDetector,
};
pub use partition_state::{InMemoryPartitionState, NullPartitionState};
#[cfg(feature = "redb")]
pub use store::RedbTopologyStore;
pub use store::{MemoryTopologyStore, PersistedTopology};
pub use transport::{InMemoryNetwork, InMemoryTransport};

// ---------------------------------------------------------------------------
// Multi-node tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use meridian_core::{EventKind, ExchangeId, NodeId, TopologyVersion};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;

    const A: u128 = 0xA;
    const B: u128 = 0xB;
    const C: u128 = 0xC;
    const D: u128 = 0xD;
    const E: u128 = 0xE;
    const F: u128 = 0xF;

    fn node(n: u128) -> NodeId {
        Uuid::from_u128(n)
    }

    fn v(major: u64, minor: u32) -> TopologyVersion {
        TopologyVersion::new(major, minor)
    }

    fn config(partition_count: u32) -> ClusterConfig {
        ClusterConfig {
            partition_count,
            backup_count: 1,
            exchange_timeout_ms: 1000,
            tick_interval_ms: 50,
            ..ClusterConfig::default()
        }
    }

    struct TestNode {
        service: ExchangeService,
        handle: CoordinatorHandle,
        store: MemoryTopologyStore,
        batches: mpsc::UnboundedReceiver<RebalanceBatch>,
    }

    struct TestCluster {
        network: InMemoryNetwork,
        config: ClusterConfig,
        nodes: BTreeMap<NodeId, TestNode>,
    }

    impl TestCluster {
        fn new(config: ClusterConfig) -> Self {
            Self {
                network: InMemoryNetwork::new(),
                config,
                nodes: BTreeMap::new(),
            }
        }

        async fn start(&mut self, n: u128) {
            self.start_with_store(n, MemoryTopologyStore::new()).await;
        }

        async fn start_with_store(&mut self, n: u128, store: MemoryTopologyStore) {
            let id = node(n);
            let (transport, inbox) = self.network.register(id);
            let (scheduler, batches) = ChannelRebalanceScheduler::new();
            let partitions = Arc::new(InMemoryPartitionState::new());
            let deps = CoordinatorDeps {
                transport: Arc::new(transport),
                partitions: partitions.clone(),
                durability: partitions,
                store: Arc::new(store.clone()),
                rebalance: Arc::new(scheduler),
            };
            let service = ExchangeService::start(id, self.config.clone(), deps, Some(inbox))
                .await
                .unwrap();
            let handle = service.handle();
            self.nodes.insert(
                id,
                TestNode {
                    service,
                    handle,
                    store,
                    batches,
                },
            );
        }

        fn handle(&self, n: u128) -> &CoordinatorHandle {
            &self.nodes[&node(n)].handle
        }

        async fn report(&self, event: MembershipEvent) {
            for test_node in self.nodes.values() {
                test_node.handle.notify(event.clone()).await.unwrap();
            }
        }

        async fn join(&self, ids: &[u128]) {
            for id in ids {
                self.report(MembershipEvent::joined(node(*id))).await;
            }
        }

        /// Stops a node and detaches it from the network, keeping its store.
        async fn crash(&mut self, n: u128) -> MemoryTopologyStore {
            let test_node = self.nodes.remove(&node(n)).unwrap();
            self.network.unregister(&node(n));
            test_node.service.stop().await;
            test_node.store
        }

        async fn await_on(&self, ids: &[u128], version: TopologyVersion) -> Vec<Arc<AffinityAssignment>> {
            let mut assignments = Vec::new();
            for id in ids {
                let assignment = tokio::time::timeout(
                    Duration::from_secs(60),
                    self.handle(*id).await_version(version),
                )
                .await
                .expect("timed out waiting for version")
                .expect("version did not complete");
                assignments.push(assignment);
            }
            assignments
        }

        async fn await_all(&self, version: TopologyVersion) -> Vec<Arc<AffinityAssignment>> {
            let ids: Vec<u128> = self.nodes.keys().map(Uuid::as_u128).collect();
            self.await_on(&ids, version).await
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    fn assert_same_digest(assignments: &[Arc<AffinityAssignment>]) {
        let digest = assignments[0].digest();
        for assignment in assignments {
            assert_eq!(assignment.digest(), digest);
        }
    }

    fn ready_exchange(handle: &CoordinatorHandle) -> ExchangeId {
        handle.state().ready().exchange_id.unwrap()
    }

    async fn started(ids: &[u128], partition_count: u32) -> TestCluster {
        let mut cluster = TestCluster::new(config(partition_count));
        for id in ids {
            cluster.start(*id).await;
        }
        cluster.join(ids).await;
        cluster.await_all(v(1, 0)).await;
        cluster
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_bootstraps_to_one_assignment() {
        let mut cluster = TestCluster::new(config(16));
        for id in [A, B, C] {
            cluster.start(id).await;
        }
        cluster.join(&[A, B, C]).await;

        let assignments = cluster.await_all(v(1, 0)).await;
        assert_same_digest(&assignments);
        for pid in 0..16 {
            assert_eq!(assignments[0].owners(pid).len(), 2);
        }

        let ready = cluster.handle(C).state().ready();
        assert_eq!(ready.members.node_ids(), vec![node(A), node(B), node(C)]);
        assert_eq!(
            ready.exchange_id,
            Some(ExchangeId::new(node(A), EventKind::Joined, v(1, 0)).unwrap())
        );

        let route = cluster.handle(B).route("user:42").await.unwrap();
        assert_eq!(route.version, v(1, 0));
        assert_eq!(route.owners, assignments[0].owners(route.partition_id));

        let a = cluster.nodes.get_mut(&node(A)).unwrap();
        let batch = a.batches.recv().await.unwrap();
        assert_eq!(batch.version, v(1, 0));
        assert!(batch.tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_member_is_removed_and_its_backup_promoted() {
        let mut cluster = started(&[A, B, C], 4).await;
        let before = cluster.handle(A).assignment_for(v(1, 0)).unwrap();
        let b_primaries = before.primary_partitions(&node(B));
        assert!(!b_primaries.is_empty());

        cluster.crash(B).await;
        cluster.report(MembershipEvent::failed(node(B))).await;
        let after = cluster.await_all(v(2, 0)).await;
        assert_same_digest(&after);

        assert_eq!(
            ready_exchange(cluster.handle(A)),
            ExchangeId::new(node(B), EventKind::Failed, v(2, 0)).unwrap()
        );
        assert!(!after[0].nodes().contains(&node(B)));
        for pid in b_primaries {
            assert_eq!(after[0].primary(pid), before.backups(pid).first().copied());
        }

        let a = cluster.nodes.get_mut(&node(A)).unwrap();
        assert_eq!(a.batches.recv().await.unwrap().version, v(1, 0));
        let batch = a.batches.recv().await.unwrap();
        assert_eq!(batch.version, v(2, 0));
        assert!(batch.tasks.iter().any(|task| task.promotion));
    }

    #[tokio::test(start_paused = true)]
    async fn left_and_failed_reports_produce_one_exchange() {
        let mut cluster = started(&[A, B, C], 16).await;

        cluster.crash(C).await;
        cluster.report(MembershipEvent::left(node(C))).await;
        cluster.report(MembershipEvent::failed(node(C))).await;
        cluster.await_all(v(2, 0)).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        for id in [A, B] {
            let handle = cluster.handle(id);
            assert_eq!(handle.current_version(), v(2, 0));
            assert_eq!(ready_exchange(handle).node_id(), node(C));
            assert_eq!(handle.state().ready().members.node_ids(), vec![node(A), node(B)]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_member_is_presumed_failed_after_timeout() {
        let mut cluster = started(&[A, B, C, D], 16).await;

        cluster.network.isolate(node(D));
        cluster.start(E).await;
        cluster.report(MembershipEvent::joined(node(E))).await;

        let live = [A, B, C, E];
        let joined = cluster.await_on(&live, v(2, 0)).await;
        assert_same_digest(&joined);
        let followup = cluster.await_on(&live, v(3, 0)).await;
        assert_same_digest(&followup);

        let ready = cluster.handle(E).state().ready();
        assert_eq!(
            ready.exchange_id,
            Some(ExchangeId::new(node(D), EventKind::Failed, v(3, 0)).unwrap())
        );
        assert_eq!(
            ready.members.node_ids(),
            vec![node(A), node(B), node(C), node(E)]
        );
        assert!(!followup[0].nodes().contains(&node(D)));
        assert_eq!(cluster.handle(D).current_version(), v(1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn member_reported_failed_mid_exchange_never_owns_partitions() {
        let mut cluster = started(&[A, B, C, D], 16).await;

        // D stays silent, so the exchange admitting E waits on it.
        cluster.network.isolate(node(D));
        cluster.start(E).await;
        cluster.report(MembershipEvent::joined(node(E))).await;
        eventually(|| cluster.handle(A).state().in_flight() == Some(v(2, 0))).await;

        cluster.report(MembershipEvent::failed(node(D))).await;
        let err = cluster.handle(A).await_version(v(2, 0)).await.unwrap_err();
        assert!(
            matches!(
                err,
                ClusterError::ExchangeAbandoned { superseded_by: Some(next), .. } if next == v(3, 0)
            ),
            "{err}"
        );

        let live = [A, B, C, E];
        let reissued = cluster.await_on(&live, v(3, 0)).await;
        assert_same_digest(&reissued);
        assert!(!reissued[0].nodes().contains(&node(D)));
        assert!(reissued[0].nodes().contains(&node(E)));
        assert_eq!(
            ready_exchange(cluster.handle(E)),
            ExchangeId::new(node(D), EventKind::Failed, v(3, 0)).unwrap()
        );
        for id in live {
            assert!(cluster.handle(id).assignment_for(v(2, 0)).is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_delivery_changes_nothing() {
        async fn run(duplicate: bool) -> Vec<String> {
            let mut cluster = TestCluster::new(config(16));
            cluster.network.set_duplicate_delivery(duplicate);
            for id in [A, B, C, D] {
                cluster.start(id).await;
            }
            cluster.join(&[A, B, C, D]).await;
            let first = cluster.await_all(v(1, 0)).await;
            assert_same_digest(&first);

            cluster.crash(D).await;
            cluster.report(MembershipEvent::failed(node(D))).await;
            let second = cluster.await_all(v(2, 0)).await;
            assert_same_digest(&second);

            tokio::time::sleep(Duration::from_secs(5)).await;
            for handle in cluster.nodes.values().map(|n| &n.handle) {
                assert_eq!(handle.current_version(), v(2, 0));
            }
            vec![first[0].digest(), second[0].digest()]
        }

        assert_eq!(run(false).await, run(true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn master_failure_mid_exchange_is_folded_into_newer_version() {
        let mut cluster = started(&[A, B, C, D], 16).await;

        // D never answers, so A's exchange for E stays in flight.
        cluster.network.isolate(node(D));
        cluster.start(E).await;
        cluster.report(MembershipEvent::joined(node(E))).await;
        for id in [B, C, E] {
            eventually(|| cluster.handle(id).state().in_flight() == Some(v(2, 0))).await;
        }

        cluster.crash(A).await;
        cluster.report(MembershipEvent::failed(node(A))).await;

        for id in [B, C] {
            let err = cluster.handle(id).await_version(v(2, 0)).await.unwrap_err();
            assert!(
                matches!(
                    err,
                    ClusterError::ExchangeAbandoned { superseded_by: Some(next), .. } if next == v(3, 0)
                ),
                "{err}"
            );
        }

        let folded = cluster.await_on(&[B, C, E], v(3, 0)).await;
        assert_same_digest(&folded);
        assert!(!folded[0].nodes().contains(&node(A)));

        cluster.await_on(&[B, C, E], v(4, 0)).await;
        let ready = cluster.handle(C).state().ready();
        assert_eq!(ready.members.node_ids(), vec![node(B), node(C), node(E)]);
        assert_eq!(ready_exchange(cluster.handle(C)).node_id(), node(D));
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_node_replays_then_rejoins() {
        let mut cluster = started(&[A, B, C], 16).await;

        let store = cluster.crash(C).await;
        cluster.report(MembershipEvent::failed(node(C))).await;
        cluster.await_all(v(2, 0)).await;

        cluster.start_with_store(C, store).await;
        assert_eq!(cluster.handle(C).current_version(), v(1, 0));
        assert!(cluster.handle(C).assignment_for(v(1, 0)).is_some());

        cluster.report(MembershipEvent::joined(node(C))).await;
        let rejoined = cluster.await_all(v(3, 0)).await;
        assert_same_digest(&rejoined);
        assert_eq!(
            cluster.handle(C).state().ready().members.node_ids(),
            vec![node(A), node(B), node(C)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replaying_a_topology_newer_than_the_cluster_halts() {
        let version = v(5, 0);
        let members = MembersView::new(
            version,
            [F, 0x10]
                .into_iter()
                .map(|n| MemberInfo {
                    node_id: node(n),
                    join_version: 1,
                    failure_domain: None,
                })
                .collect(),
        );
        let assignment = compute_assignment(&AssignmentInput {
            version,
            members: &members.members,
            partition_count: 8,
            backup_count: 1,
            previous: None,
            snapshots: &BTreeMap::new(),
        })
        .assignment;
        let store = MemoryTopologyStore::new();
        store
            .save(&PersistedTopology {
                exchange_id: ExchangeId::new(node(0x10), EventKind::Joined, version).unwrap(),
                members,
                assignment,
            })
            .await
            .unwrap();

        let mut cluster = TestCluster::new(config(8));
        cluster.start(A).await;
        cluster.start_with_store(F, store).await;
        assert_eq!(cluster.handle(F).current_version(), version);
        cluster.join(&[A, F]).await;

        let err = tokio::time::timeout(
            Duration::from_secs(60),
            cluster.handle(F).await_version(v(6, 0)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, ClusterError::Halted { .. }), "{err}");
        assert!(cluster.handle(F).state().halted().unwrap().contains("regression"));

        cluster.await_on(&[A], v(2, 0)).await;
        assert_eq!(
            cluster.handle(A).state().ready().members.node_ids(),
            vec![node(A)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recalculation_runs_on_master_under_minor_version() {
        let cluster = started(&[A, B, C], 16).await;

        let err = cluster.handle(B).request_recalculation(2).await.unwrap_err();
        assert!(
            matches!(err, ClusterError::NotCoordinator { master: Some(m) } if m == node(A)),
            "{err}"
        );

        let assignment = cluster.handle(A).request_recalculation(2).await.unwrap();
        assert_eq!(assignment.version(), v(1, 1));
        assert_eq!(assignment.backup_count(), 2);
        for pid in 0..16 {
            assert_eq!(assignment.owners(pid).len(), 3);
        }

        let all = cluster.await_all(v(1, 1)).await;
        assert_same_digest(&all);
        assert_eq!(
            ready_exchange(cluster.handle(C)).topology_version(),
            v(1, 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reject_mode_fails_fast_while_exchange_runs() {
        let mut cluster = TestCluster::new(ClusterConfig {
            consistency_mode: ConsistencyMode::Reject,
            ..config(16)
        });
        for id in [A, B] {
            cluster.start(id).await;
        }
        cluster.join(&[A, B]).await;
        cluster.await_all(v(1, 0)).await;

        cluster.network.isolate(node(B));
        cluster.report(MembershipEvent::joined(node(C))).await;
        eventually(|| cluster.handle(A).state().in_flight().is_some()).await;

        let err = cluster.handle(A).route("k").await.unwrap_err();
        assert!(matches!(err, ClusterError::TopologyChanging { .. }), "{err}");
    }
}
