//! Channel identity and shard routing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a node in the cluster. Assigned by the operator, never zero.
pub type NodeId = u64;

/// Sentinel for "no leader known yet".
pub const NO_LEADER: NodeId = 0;

/// Key uniquely identifying a channel: the channel id joined with its type.
///
/// The key doubles as the shard-log identifier handed to the log storage, so
/// `(key, log index)` uniquely identifies a log entry across the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(channel_id: &str, channel_type: u8) -> Self {
        ChannelKey(format!("{channel_id}#{channel_type}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable hash used to pin the channel to a reactor shard.
    pub fn shard_hash(&self) -> u32 {
        crc32c::crc32c(self.0.as_bytes())
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_per_identity() {
        let a = ChannelKey::new("room.42", 2);
        let b = ChannelKey::new("room.42", 2);
        assert_eq!(a, b);
        assert_eq!(a.shard_hash(), b.shard_hash());
    }

    #[test]
    fn type_disambiguates_same_id() {
        let group = ChannelKey::new("alice", 1);
        let personal = ChannelKey::new("alice", 2);
        assert_ne!(group, personal);
    }
}
