//! Local partition state reported in exchange contributions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use meridian_core::TopologyVersion;

use super::traits::{DurabilityCheck, PartitionStateProvider};

/// Update counters for locally held partitions, kept in a `DashMap` so
/// writers on different partitions never contend.
#[derive(Debug)]
pub struct InMemoryPartitionState {
    counters: DashMap<u32, u64>,
    durable: AtomicBool,
}

impl Default for InMemoryPartitionState {
    fn default() -> Self {
        Self {
            counters: DashMap::new(),
            durable: AtomicBool::new(true),
        }
    }
}

impl InMemoryPartitionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps the counter of `partition_id` and returns the new value.
    pub fn record_update(&self, partition_id: u32) -> u64 {
        let mut entry = self.counters.entry(partition_id).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn set_counter(&self, partition_id: u32, counter: u64) {
        self.counters.insert(partition_id, counter);
    }

    /// Forgets a partition handed off to another node.
    pub fn evict(&self, partition_id: u32) {
        self.counters.remove(&partition_id);
    }

    /// Simulates the write-ahead log falling behind (or catching up).
    pub fn set_durable(&self, durable: bool) {
        self.durable.store(durable, Ordering::Release);
    }
}

impl PartitionStateProvider for InMemoryPartitionState {
    fn local_counters(&self) -> BTreeMap<u32, u64> {
        self.counters
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}

impl DurabilityCheck for InMemoryPartitionState {
    fn is_durable(&self, _version: TopologyVersion) -> bool {
        self.durable.load(Ordering::Acquire)
    }
}

/// A node holding no partition data. Always durable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPartitionState;

impl PartitionStateProvider for NullPartitionState {
    fn local_counters(&self) -> BTreeMap<u32, u64> {
        BTreeMap::new()
    }
}

impl DurabilityCheck for NullPartitionState {
    fn is_durable(&self, _version: TopologyVersion) -> bool {
        true
    }
}
