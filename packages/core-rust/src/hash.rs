//! Stable hash utilities for partition routing and placement.
//!
//! Every node must compute identical partition ids and placement weights, so
//! these functions are fixed, seedless, and independent of platform word size
//! or `std`'s randomized `Hasher`s:
//!
//! - [`fnv1a_64`]: 64-bit FNV-1a over raw bytes, used for key routing
//! - [`mix64`]: `SplitMix64` finalizer, used to decorrelate inputs
//! - [`rendezvous_weight`]: highest-random-weight score of a node for a partition

use crate::types::NodeId;

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Computes a 64-bit FNV-1a hash of a byte slice.
///
/// # Examples
///
/// ```
/// use meridian_core::hash::fnv1a_64;
///
/// assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325); // offset basis
/// assert_eq!(fnv1a_64(b"hello"), 0xa430_d846_80aa_bd0b);
/// ```
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `SplitMix64` finalizer: a bijective avalanche mix of a 64-bit value.
#[must_use]
pub fn mix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Rendezvous (highest-random-weight) score of `node` for `partition_id`.
///
/// For a fixed partition, ranking nodes by descending weight yields a
/// preference list in which removing one node never reorders the others. This
/// is what bounds partition movement to the departed node's share.
#[must_use]
pub fn rendezvous_weight(partition_id: u32, node: &NodeId) -> u64 {
    mix64(fnv1a_64(node.as_bytes()) ^ mix64(u64::from(partition_id)))
}
