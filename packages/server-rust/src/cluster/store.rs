//! Persistence of the last ready topology.
//!
//! A restarted node replays what it saved here before it accepts any
//! membership event, so it can never fall back to an older assignment.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use meridian_core::{ExchangeId, TopologyVersion};

use super::affinity::AffinityAssignment;
use super::traits::TopologyStore;
use super::types::MembersView;

/// The ready topology as written to a `TopologyStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTopology {
    pub exchange_id: ExchangeId,
    pub members: MembersView,
    pub assignment: AffinityAssignment,
}

impl PersistedTopology {
    #[must_use]
    pub fn version(&self) -> TopologyVersion {
        self.assignment.version()
    }

    /// Encodes to named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if serialization fails.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes from `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns the decoder error for malformed or corrupt input.
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// MemoryTopologyStore
// ---------------------------------------------------------------------------

/// In-memory store. Clones share the same slot, so a test can hand one clone
/// to a node, drop the node, and restart it with another clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryTopologyStore {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryTopologyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopologyStore for MemoryTopologyStore {
    async fn load(&self) -> anyhow::Result<Option<PersistedTopology>> {
        let bytes = self.slot.lock().clone();
        bytes.as_deref().map(PersistedTopology::from_bytes).transpose()
    }

    async fn save(&self, topology: &PersistedTopology) -> anyhow::Result<()> {
        let bytes = topology.to_bytes()?;
        *self.slot.lock() = Some(bytes);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RedbTopologyStore
// ---------------------------------------------------------------------------

#[cfg(feature = "redb")]
pub use redb_store::RedbTopologyStore;

#[cfg(feature = "redb")]
mod redb_store {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;
    use redb::{Database, ReadableTable, TableDefinition, TableError};

    use super::PersistedTopology;
    use crate::cluster::traits::TopologyStore;

    const TOPOLOGY: TableDefinition<&str, &[u8]> = TableDefinition::new("topology");
    const READY_KEY: &str = "ready";

    /// Single-file store backed by `redb`. Each save is one committed write
    /// transaction.
    #[derive(Clone)]
    pub struct RedbTopologyStore {
        db: Arc<Database>,
    }

    impl std::fmt::Debug for RedbTopologyStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedbTopologyStore").finish_non_exhaustive()
        }
    }

    impl RedbTopologyStore {
        /// Opens or creates the database file at `path`.
        ///
        /// # Errors
        ///
        /// Returns the `redb` error if the file cannot be opened.
        pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
            let db = Database::create(path.as_ref())?;
            Ok(Self { db: Arc::new(db) })
        }

        fn read_ready(db: &Database) -> anyhow::Result<Option<Vec<u8>>> {
            let txn = db.begin_read()?;
            let table = match txn.open_table(TOPOLOGY) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let value = table.get(READY_KEY)?;
            Ok(value.map(|guard| guard.value().to_vec()))
        }

        fn write_ready(db: &Database, bytes: &[u8]) -> anyhow::Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TOPOLOGY)?;
                table.insert(READY_KEY, bytes)?;
            }
            txn.commit()?;
            Ok(())
        }
    }

    #[async_trait]
    impl TopologyStore for RedbTopologyStore {
        async fn load(&self) -> anyhow::Result<Option<PersistedTopology>> {
            let db = Arc::clone(&self.db);
            let bytes = tokio::task::spawn_blocking(move || Self::read_ready(&db)).await??;
            bytes.as_deref().map(PersistedTopology::from_bytes).transpose()
        }

        async fn save(&self, topology: &PersistedTopology) -> anyhow::Result<()> {
            let bytes = topology.to_bytes()?;
            let db = Arc::clone(&self.db);
            tokio::task::spawn_blocking(move || Self::write_ready(&db, &bytes)).await?
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use meridian_core::EventKind;
    use uuid::Uuid;

    use super::*;
    use crate::cluster::affinity::{compute_assignment, AssignmentInput};
    use crate::cluster::types::MemberInfo;

    fn persisted(major: u64) -> PersistedTopology {
        let version = TopologyVersion::new(major, 0);
        let members = MembersView::new(
            version,
            (1..=3)
                .map(|n| MemberInfo {
                    node_id: Uuid::from_u128(n),
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
        PersistedTopology {
            exchange_id: ExchangeId::new(Uuid::from_u128(3), EventKind::Joined, version).unwrap(),
            members,
            assignment,
        }
    }

    #[tokio::test]
    async fn memory_store_starts_empty_and_keeps_latest() {
        let store = MemoryTopologyStore::new();
        assert!(store.load().await.unwrap().is_none());

        store.save(&persisted(1)).await.unwrap();
        store.save(&persisted(2)).await.unwrap();

        let shared = store.clone();
        let loaded = shared.load().await.unwrap().unwrap();
        assert_eq!(loaded, persisted(2));
        assert_eq!(loaded.version(), TopologyVersion::new(2, 0));
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        assert!(PersistedTopology::from_bytes(&[0xc1, 0x00]).is_err());
    }

    #[cfg(feature = "redb")]
    #[tokio::test]
    async fn redb_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.redb");

        {
            let store = RedbTopologyStore::open(&path).unwrap();
            assert!(store.load().await.unwrap().is_none());
            store.save(&persisted(4)).await.unwrap();
        }

        let reopened = RedbTopologyStore::open(&path).unwrap();
        assert_eq!(reopened.load().await.unwrap(), Some(persisted(4)));
    }
}
