//! Locally shared topology state.
//!
//! `TopologyState` is the only exchange state visible outside the
//! coordinator:
//! - `ReadyTopology`: the ready version, published through `ArcSwap` so a
//!   reader sees either the old or the new topology, never a mix
//! - bounded assignment history for `assignment_for`
//! - an in-flight marker plus abandoned versions, broadcast over a `watch`
//!   channel so `await_version` and `route` can block or fail fast

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use meridian_core::{hash_to_partition, ExchangeId, NodeId, TopologyVersion};

use super::affinity::AffinityAssignment;
use super::error::ClusterError;
use super::types::{ConsistencyMode, MembersView};

// ---------------------------------------------------------------------------
// ReadyTopology / Route
// ---------------------------------------------------------------------------

/// A completed topology: version, membership and assignment.
#[derive(Debug, Clone)]
pub struct ReadyTopology {
    pub version: TopologyVersion,
    /// Exchange that produced this topology; `None` before the first one.
    pub exchange_id: Option<ExchangeId>,
    pub members: MembersView,
    pub assignment: Arc<AffinityAssignment>,
}

impl ReadyTopology {
    fn initial(partition_count: u32, backup_count: u32) -> Self {
        let version = TopologyVersion::initial();
        Self {
            version,
            exchange_id: None,
            members: MembersView::default(),
            assignment: Arc::new(AffinityAssignment::unassigned(
                version,
                partition_count,
                backup_count,
            )),
        }
    }
}

/// Where a key lives at a ready version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub partition_id: u32,
    pub version: TopologyVersion,
    /// Primary first. Empty if the partition has no live owner.
    pub owners: Vec<NodeId>,
}

// ---------------------------------------------------------------------------
// TopologyState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Progress {
    ready: TopologyVersion,
    in_flight: Option<TopologyVersion>,
    /// Abandoned version → the version that superseded it, when known.
    abandoned: BTreeMap<TopologyVersion, Option<TopologyVersion>>,
    halted: Option<String>,
}

enum Resolution {
    Ready,
    Abandoned(Option<TopologyVersion>),
    Halted(String),
    Wait,
}

/// Ready topology plus history, shared by the coordinator and every reader.
///
/// Only the coordinator mutates it.
pub struct TopologyState {
    local_node_id: NodeId,
    ready: ArcSwap<ReadyTopology>,
    history: RwLock<BTreeMap<TopologyVersion, Arc<AffinityAssignment>>>,
    history_size: usize,
    progress: watch::Sender<Progress>,
}

impl fmt::Debug for TopologyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyState")
            .field("local_node_id", &self.local_node_id)
            .field("ready", &self.current_version())
            .field("in_flight", &self.in_flight())
            .field("history", &self.history.read().len())
            .finish_non_exhaustive()
    }
}

impl TopologyState {
    #[must_use]
    pub fn new(
        local_node_id: NodeId,
        partition_count: u32,
        backup_count: u32,
        history_size: usize,
    ) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            local_node_id,
            ready: ArcSwap::new(Arc::new(ReadyTopology::initial(
                partition_count,
                backup_count,
            ))),
            history: RwLock::new(BTreeMap::new()),
            history_size: history_size.max(1),
            progress,
        }
    }

    #[must_use]
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// The latest ready version. `0.0` before the first exchange.
    #[must_use]
    pub fn current_version(&self) -> TopologyVersion {
        self.ready.load().version
    }

    #[must_use]
    pub fn ready(&self) -> Arc<ReadyTopology> {
        self.ready.load_full()
    }

    #[must_use]
    pub fn ready_assignment(&self) -> Arc<AffinityAssignment> {
        Arc::clone(&self.ready.load().assignment)
    }

    /// Assignment of a retained version.
    #[must_use]
    pub fn assignment_for(&self, version: TopologyVersion) -> Option<Arc<AffinityAssignment>> {
        let ready = self.ready.load();
        if ready.version == version {
            return Some(Arc::clone(&ready.assignment));
        }
        self.history.read().get(&version).cloned()
    }

    /// Version of the exchange currently running, if any.
    #[must_use]
    pub fn in_flight(&self) -> Option<TopologyVersion> {
        self.progress.borrow().in_flight
    }

    #[must_use]
    pub fn is_abandoned(&self, version: TopologyVersion) -> bool {
        self.progress.borrow().abandoned.contains_key(&version)
    }

    /// Reason the local node stopped participating, if it did.
    #[must_use]
    pub fn halted(&self) -> Option<String> {
        self.progress.borrow().halted.clone()
    }

    /// Marks `version` as in flight.
    pub fn begin(&self, version: TopologyVersion) {
        self.progress.send_modify(|p| p.in_flight = Some(version));
    }

    /// Atomically makes `topology` the ready topology.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::VersionRegression`] unless `topology.version`
    /// is newer than the current ready version.
    pub fn publish(&self, topology: ReadyTopology) -> Result<(), ClusterError> {
        let local = self.current_version();
        let version = topology.version;
        if version <= local {
            return Err(ClusterError::VersionRegression {
                local,
                observed: version,
            });
        }

        {
            let mut history = self.history.write();
            history.insert(version, Arc::clone(&topology.assignment));
            while history.len() > self.history_size {
                history.pop_first();
            }
        }
        self.ready.store(Arc::new(topology));

        let oldest = self.history.read().keys().next().copied().unwrap_or(version);
        self.progress.send_modify(|p| {
            p.ready = version;
            if p.in_flight.is_some_and(|v| v <= version) {
                p.in_flight = None;
            }
            p.abandoned.retain(|v, _| *v >= oldest);
        });
        debug!(node = %self.local_node_id, %version, "topology published");
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("meridian_topology_ready_major").set(version.major as f64);
        Ok(())
    }

    /// Records that `version` will never complete.
    pub fn abandon(&self, version: TopologyVersion, superseded_by: Option<TopologyVersion>) {
        self.progress.send_modify(|p| {
            p.abandoned.insert(version, superseded_by);
            if p.in_flight == Some(version) {
                p.in_flight = superseded_by;
            }
        });
    }

    /// Stops local participation; every waiter fails with `Halted`.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.progress.send_modify(|p| {
            p.in_flight = None;
            p.halted = Some(reason);
        });
    }

    /// Waits until `version` is ready.
    ///
    /// Returns the assignment of `version`, or the current one if `version`
    /// is older than the retained history.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::ExchangeAbandoned`] if `version` was superseded or
    ///   skipped.
    /// - [`ClusterError::Halted`] if the local node stopped participating.
    pub async fn await_version(
        &self,
        version: TopologyVersion,
    ) -> Result<Arc<AffinityAssignment>, ClusterError> {
        let mut rx = self.progress.subscribe();
        loop {
            let resolution = {
                let p = rx.borrow_and_update();
                if let Some(reason) = &p.halted {
                    Resolution::Halted(reason.clone())
                } else if let Some(superseded_by) = p.abandoned.get(&version) {
                    Resolution::Abandoned(*superseded_by)
                } else if p.ready >= version {
                    Resolution::Ready
                } else {
                    Resolution::Wait
                }
            };
            match resolution {
                Resolution::Ready => return self.resolve_ready(version),
                Resolution::Abandoned(superseded_by) => {
                    return Err(ClusterError::ExchangeAbandoned {
                        version,
                        superseded_by,
                    })
                }
                Resolution::Halted(reason) => return Err(ClusterError::Halted { reason }),
                Resolution::Wait => {}
            }
            if rx.changed().await.is_err() {
                return Err(ClusterError::CoordinatorStopped);
            }
        }
    }

    fn resolve_ready(
        &self,
        version: TopologyVersion,
    ) -> Result<Arc<AffinityAssignment>, ClusterError> {
        if let Some(assignment) = self.assignment_for(version) {
            return Ok(assignment);
        }
        let oldest = self.history.read().keys().next().copied();
        if oldest.map_or(true, |oldest| version < oldest) {
            return Ok(self.ready_assignment());
        }
        Err(ClusterError::ExchangeAbandoned {
            version,
            superseded_by: Some(self.current_version()),
        })
    }

    /// Resolves the owners of `key`, honoring `mode` while an exchange runs.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::TopologyChanging`] in `Reject` mode while an
    ///   exchange is in flight.
    /// - [`ClusterError::Halted`] if the local node stopped participating.
    pub async fn route(&self, key: &str, mode: ConsistencyMode) -> Result<Route, ClusterError> {
        while let Some(version) = self.in_flight() {
            match mode {
                ConsistencyMode::Reject => {
                    return Err(ClusterError::TopologyChanging { version });
                }
                ConsistencyMode::Block => match self.await_version(version).await {
                    Ok(_) | Err(ClusterError::ExchangeAbandoned { .. }) => {}
                    Err(err) => return Err(err),
                },
            }
        }

        let ready = self.ready();
        let partition_id = hash_to_partition(key, ready.assignment.partition_count());
        Ok(Route {
            partition_id,
            version: ready.version,
            owners: ready.assignment.owners(partition_id).to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::cluster::types::MemberInfo;

    fn node(n: u128) -> NodeId {
        Uuid::from_u128(n)
    }

    fn state() -> TopologyState {
        TopologyState::new(node(1), 4, 1, 3)
    }

    fn topology(major: u64, owner: u128) -> ReadyTopology {
        let version = TopologyVersion::new(major, 0);
        let members = MembersView::new(
            version,
            vec![MemberInfo {
                node_id: node(owner),
                join_version: 1,
                failure_domain: None,
            }],
        );
        let assignment = crate::cluster::affinity::compute_assignment(
            &crate::cluster::affinity::AssignmentInput {
                version,
                members: &members.members,
                partition_count: 4,
                backup_count: 1,
                previous: None,
                snapshots: &BTreeMap::new(),
            },
        )
        .assignment;
        ReadyTopology {
            version,
            exchange_id: None,
            members,
            assignment: Arc::new(assignment),
        }
    }

    #[test]
    fn starts_at_initial_version_with_no_owners() {
        let state = state();
        assert!(state.current_version().is_initial());
        assert!(state.ready_assignment().nodes().is_empty());
        assert!(state.in_flight().is_none());
    }

    #[test]
    fn publish_replaces_ready_topology() {
        let state = state();
        state.publish(topology(1, 7)).unwrap();
        assert_eq!(state.current_version(), TopologyVersion::new(1, 0));
        assert_eq!(state.ready_assignment().primary(0), Some(node(7)));
    }

    #[test]
    fn publish_rejects_stale_versions() {
        let state = state();
        state.publish(topology(2, 7)).unwrap();
        let err = state.publish(topology(2, 8)).unwrap_err();
        assert!(matches!(err, ClusterError::VersionRegression { .. }));
        assert!(state.publish(topology(1, 8)).is_err());
        assert_eq!(state.ready_assignment().primary(0), Some(node(7)));
    }

    #[test]
    fn history_is_bounded() {
        let state = state();
        for major in 1..=5 {
            state.publish(topology(major, u128::from(major))).unwrap();
        }
        assert!(state.assignment_for(TopologyVersion::new(1, 0)).is_none());
        assert!(state.assignment_for(TopologyVersion::new(2, 0)).is_none());
        let v3 = state.assignment_for(TopologyVersion::new(3, 0)).unwrap();
        assert_eq!(v3.primary(0), Some(node(3)));
    }

    #[test]
    fn publish_clears_in_flight_marker() {
        let state = state();
        state.begin(TopologyVersion::new(1, 0));
        assert_eq!(state.in_flight(), Some(TopologyVersion::new(1, 0)));
        state.publish(topology(1, 7)).unwrap();
        assert!(state.in_flight().is_none());
    }

    #[tokio::test]
    async fn await_ready_version_returns_immediately() {
        let state = state();
        state.publish(topology(1, 7)).unwrap();
        let assignment = state.await_version(TopologyVersion::new(1, 0)).await.unwrap();
        assert_eq!(assignment.version(), TopologyVersion::new(1, 0));
    }

    #[tokio::test]
    async fn await_older_than_history_returns_current() {
        let state = state();
        for major in 1..=5 {
            state.publish(topology(major, 7)).unwrap();
        }
        let assignment = state.await_version(TopologyVersion::new(1, 0)).await.unwrap();
        assert_eq!(assignment.version(), TopologyVersion::new(5, 0));
    }

    #[tokio::test]
    async fn await_blocks_until_published() {
        let state = Arc::new(state());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.await_version(TopologyVersion::new(2, 0)).await })
        };
        tokio::task::yield_now().await;
        state.publish(topology(1, 7)).unwrap();
        state.publish(topology(2, 8)).unwrap();
        let assignment = waiter.await.unwrap().unwrap();
        assert_eq!(assignment.primary(0), Some(node(8)));
    }

    #[tokio::test]
    async fn await_abandoned_version_fails() {
        let state = Arc::new(state());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.await_version(TopologyVersion::new(2, 0)).await })
        };
        tokio::task::yield_now().await;
        state.abandon(TopologyVersion::new(2, 0), Some(TopologyVersion::new(3, 0)));
        match waiter.await.unwrap() {
            Err(ClusterError::ExchangeAbandoned { superseded_by, .. }) => {
                assert_eq!(superseded_by, Some(TopologyVersion::new(3, 0)));
            }
            other => panic!("expected abandonment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn await_skipped_version_fails() {
        let state = state();
        state.publish(topology(1, 7)).unwrap();
        state.publish(topology(3, 7)).unwrap();
        assert!(matches!(
            state.await_version(TopologyVersion::new(2, 0)).await,
            Err(ClusterError::ExchangeAbandoned { .. })
        ));
    }

    #[tokio::test]
    async fn halt_wakes_waiters() {
        let state = state();
        state.halt("excluded from membership");
        assert!(matches!(
            state.await_version(TopologyVersion::new(1, 0)).await,
            Err(ClusterError::Halted { .. })
        ));
    }

    #[tokio::test]
    async fn route_rejects_while_changing() {
        let state = state();
        state.publish(topology(1, 7)).unwrap();
        state.begin(TopologyVersion::new(2, 0));
        let err = state.route("hello", ConsistencyMode::Reject).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::TopologyChanging { version } if version == TopologyVersion::new(2, 0)
        ));
    }

    #[tokio::test]
    async fn route_blocks_until_exchange_completes() {
        let state = Arc::new(state());
        state.publish(topology(1, 7)).unwrap();
        state.begin(TopologyVersion::new(2, 0));

        let router = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.route("hello", ConsistencyMode::Block).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!router.is_finished());

        state.publish(topology(2, 8)).unwrap();
        let route = router.await.unwrap().unwrap();
        assert_eq!(route.version, TopologyVersion::new(2, 0));
        assert_eq!(route.partition_id, hash_to_partition("hello", 4));
        assert_eq!(route.owners, vec![node(8)]);
    }

    #[tokio::test]
    async fn route_follows_superseding_exchange() {
        let state = Arc::new(state());
        state.publish(topology(1, 7)).unwrap();
        state.begin(TopologyVersion::new(2, 0));

        let router = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.route("hello", ConsistencyMode::Block).await })
        };
        tokio::task::yield_now().await;
        state.abandon(TopologyVersion::new(2, 0), Some(TopologyVersion::new(3, 0)));
        tokio::task::yield_now().await;
        state.publish(topology(3, 9)).unwrap();

        let route = router.await.unwrap().unwrap();
        assert_eq!(route.version, TopologyVersion::new(3, 0));
        assert_eq!(route.owners, vec![node(9)]);
    }
}
