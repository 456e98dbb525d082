//! Shared identity types.

use uuid::Uuid;

/// Cluster-unique node identifier.
pub type NodeId = Uuid;

/// First eight hex characters of a node id, for compact log output.
#[must_use]
pub fn short_id(node_id: &NodeId) -> String {
    let mut s = node_id.simple().to_string();
    s.truncate(8);
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_eight_hex_chars() {
        let id = Uuid::from_u128(0xabcd_ef01_2345_6789_0000_0000_0000_0001);
        assert_eq!(short_id(&id), "abcdef01");
    }
}
