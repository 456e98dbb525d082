//! Meridian Core: topology versions, exchange ids, partition hashing and snapshots.

pub mod exchange_id;
pub mod hash;
pub mod partition;
pub mod types;
pub mod version;

pub use exchange_id::{EventKind, ExchangeId, InvalidExchangeId};
pub use partition::{hash_to_partition, PartitionSnapshot, SnapshotError, DEFAULT_PARTITION_COUNT};
pub use types::{short_id, NodeId};
pub use version::TopologyVersion;
