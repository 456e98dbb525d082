//! Heartbeat-based failure detection feeding membership events.
//!
//! - `PhiAccrualFailureDetector`: suspicion from the distribution of observed
//!   heartbeat intervals (Hayashibara et al., 2004)
//! - `DeadlineFailureDetector`: fixed silence bound, for tests and simulation
//! - `HeartbeatMonitor`: watches live members and reports each one that goes
//!   silent as a single `Failed` membership event

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use meridian_core::NodeId;

use super::traits::FailureDetector;
use super::types::{ClusterConfig, MembershipEvent};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the phi-accrual failure detector.
#[derive(Debug, Clone)]
pub struct PhiAccrualConfig {
    /// Phi value at which a node is considered dead.
    pub phi_threshold: f64,
    /// Maximum number of heartbeat intervals kept per node.
    pub max_sample_size: usize,
    /// Floor for the interval standard deviation (ms).
    pub min_std_dev_ms: u64,
    /// Silence bound used until enough intervals are sampled (ms).
    pub max_no_heartbeat_ms: u64,
}

impl Default for PhiAccrualConfig {
    fn default() -> Self {
        Self::from(&ClusterConfig::default())
    }
}

impl From<&ClusterConfig> for PhiAccrualConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            phi_threshold: config.phi_threshold,
            max_sample_size: config.max_sample_size.max(1),
            min_std_dev_ms: config.min_std_dev_ms,
            max_no_heartbeat_ms: config.max_no_heartbeat_ms.max(1),
        }
    }
}

/// Intervals needed before the statistical estimate replaces the fallback.
const MIN_SAMPLES: usize = 3;

// ---------------------------------------------------------------------------
// Phi-accrual failure detector
// ---------------------------------------------------------------------------

struct History {
    last_heartbeat_ms: u64,
    intervals: VecDeque<u64>,
}

/// Statistical failure detector using the phi-accrual algorithm.
///
/// Phi is `-log10(1 - CDF(elapsed))` under a normal fit of the sampled
/// intervals, so a phi of 8 means roughly a 1e-8 chance that a live node
/// would stay silent this long.
pub struct PhiAccrualFailureDetector {
    config: PhiAccrualConfig,
    histories: RwLock<BTreeMap<NodeId, History>>,
}

impl PhiAccrualFailureDetector {
    #[must_use]
    pub fn new(config: PhiAccrualConfig) -> Self {
        Self {
            config,
            histories: RwLock::new(BTreeMap::new()),
        }
    }
}

impl FailureDetector for PhiAccrualFailureDetector {
    fn heartbeat(&self, node_id: &NodeId, timestamp_ms: u64) {
        let mut histories = self.histories.write();
        let history = histories.entry(*node_id).or_insert_with(|| History {
            last_heartbeat_ms: timestamp_ms,
            intervals: VecDeque::new(),
        });
        if timestamp_ms <= history.last_heartbeat_ms {
            return;
        }
        if history.intervals.len() >= self.config.max_sample_size {
            history.intervals.pop_front();
        }
        history
            .intervals
            .push_back(timestamp_ms - history.last_heartbeat_ms);
        history.last_heartbeat_ms = timestamp_ms;
    }

    fn is_alive(&self, node_id: &NodeId, timestamp_ms: u64) -> bool {
        self.suspicion_level(node_id, timestamp_ms) < self.config.phi_threshold
    }

    fn last_heartbeat(&self, node_id: &NodeId) -> Option<u64> {
        self.histories.read().get(node_id).map(|h| h.last_heartbeat_ms)
    }

    #[allow(clippy::cast_precision_loss)]
    fn suspicion_level(&self, node_id: &NodeId, timestamp_ms: u64) -> f64 {
        let histories = self.histories.read();
        let Some(history) = histories.get(node_id) else {
            return 0.0;
        };
        let elapsed = timestamp_ms.saturating_sub(history.last_heartbeat_ms) as f64;

        if history.intervals.len() < MIN_SAMPLES {
            return elapsed / self.config.max_no_heartbeat_ms as f64 * self.config.phi_threshold;
        }
        phi(elapsed, &history.intervals, self.config.min_std_dev_ms as f64)
    }

    fn remove(&self, node_id: &NodeId) {
        self.histories.write().remove(node_id);
    }

    fn reset(&self) {
        self.histories.write().clear();
    }
}

#[allow(clippy::cast_precision_loss)]
fn phi(elapsed: f64, intervals: &VecDeque<u64>, min_std_dev: f64) -> f64 {
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<u64>() as f64 / n;
    let variance = intervals
        .iter()
        .map(|&iv| (iv as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let std_dev = variance.sqrt().max(min_std_dev);

    let y = -(elapsed - mean) / (std_dev * std::f64::consts::SQRT_2);
    let cdf = 0.5 * erfc(y);
    // Bounded away from zero so phi stays finite.
    let tail = (1.0 - cdf).max(f64::MIN_POSITIVE);
    (-tail.log10()).max(0.0)
}

/// Complementary error function, Abramowitz and Stegun 7.1.26
/// (|error| < 1.5e-7).
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * z);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736
                + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    let tail = poly * (-z * z).exp();
    if x < 0.0 {
        2.0 - tail
    } else {
        tail
    }
}

// ---------------------------------------------------------------------------
// Deadline failure detector
// ---------------------------------------------------------------------------

/// A node is dead once silent for longer than `max_no_heartbeat_ms`.
pub struct DeadlineFailureDetector {
    max_no_heartbeat_ms: u64,
    last_seen: RwLock<BTreeMap<NodeId, u64>>,
}

impl DeadlineFailureDetector {
    #[must_use]
    pub fn new(max_no_heartbeat_ms: u64) -> Self {
        Self {
            max_no_heartbeat_ms: max_no_heartbeat_ms.max(1),
            last_seen: RwLock::new(BTreeMap::new()),
        }
    }
}

impl FailureDetector for DeadlineFailureDetector {
    fn heartbeat(&self, node_id: &NodeId, timestamp_ms: u64) {
        let mut last_seen = self.last_seen.write();
        let entry = last_seen.entry(*node_id).or_insert(timestamp_ms);
        *entry = (*entry).max(timestamp_ms);
    }

    fn is_alive(&self, node_id: &NodeId, timestamp_ms: u64) -> bool {
        // Unknown nodes are alive: there is no evidence against them.
        self.last_heartbeat(node_id)
            .map_or(true, |last| timestamp_ms.saturating_sub(last) <= self.max_no_heartbeat_ms)
    }

    fn last_heartbeat(&self, node_id: &NodeId) -> Option<u64> {
        self.last_seen.read().get(node_id).copied()
    }

    /// Scales linearly to 8.0 at the deadline.
    #[allow(clippy::cast_precision_loss)]
    fn suspicion_level(&self, node_id: &NodeId, timestamp_ms: u64) -> f64 {
        self.last_heartbeat(node_id).map_or(0.0, |last| {
            timestamp_ms.saturating_sub(last) as f64 / self.max_no_heartbeat_ms as f64 * 8.0
        })
    }

    fn remove(&self, node_id: &NodeId) {
        self.last_seen.write().remove(node_id);
    }

    fn reset(&self) {
        self.last_seen.write().clear();
    }
}

// ---------------------------------------------------------------------------
// HeartbeatMonitor
// ---------------------------------------------------------------------------

/// Turns detector verdicts into `Failed` membership events.
///
/// Each watched node is reported at most once until it is watched again.
pub struct HeartbeatMonitor {
    detector: Arc<dyn FailureDetector>,
    /// Watched node → already reported.
    watched: RwLock<BTreeMap<NodeId, bool>>,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(detector: Arc<dyn FailureDetector>) -> Self {
        Self {
            detector,
            watched: RwLock::new(BTreeMap::new()),
        }
    }

    /// Starts (or restarts) watching `node_id`, counting `now_ms` as its
    /// first heartbeat.
    pub fn watch(&self, node_id: NodeId, now_ms: u64) {
        self.detector.remove(&node_id);
        self.detector.heartbeat(&node_id, now_ms);
        self.watched.write().insert(node_id, false);
    }

    pub fn unwatch(&self, node_id: &NodeId) {
        self.detector.remove(node_id);
        self.watched.write().remove(node_id);
    }

    /// Records a heartbeat from a watched node. Others are ignored.
    pub fn heartbeat(&self, node_id: &NodeId, now_ms: u64) {
        if self.watched.read().contains_key(node_id) {
            self.detector.heartbeat(node_id, now_ms);
        }
    }

    /// Returns a `Failed` event for every newly suspected node.
    pub fn check(&self, now_ms: u64) -> Vec<MembershipEvent> {
        let mut watched = self.watched.write();
        let mut events = Vec::new();
        for (node_id, reported) in watched.iter_mut() {
            if *reported || self.detector.is_alive(node_id, now_ms) {
                continue;
            }
            *reported = true;
            info!(
                node = %node_id,
                suspicion = self.detector.suspicion_level(node_id, now_ms),
                "heartbeat timeout, reporting node failed"
            );
            metrics::counter!("meridian_heartbeat_failures_total").increment(1);
            events.push(MembershipEvent::failed(*node_id));
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
