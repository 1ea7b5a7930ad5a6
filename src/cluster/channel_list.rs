//! Insertion-ordered channel container owned by a reactor shard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::channel::Channel;
use super::key::ChannelKey;

#[derive(Default)]
struct Inner {
    order: Vec<Arc<Channel>>,
    by_key: HashMap<ChannelKey, Arc<Channel>>,
}

/// Key-addressed, insertion-ordered set of channels.
///
/// The owning shard loop is the only mutator; lookups from other threads see
/// a consistent snapshot. Iteration order is insertion order, which is the
/// order the ready loop drains channels in.
#[derive(Default)]
pub struct ChannelList {
    inner: Mutex<Inner>,
}

impl ChannelList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the channel unless its key is already present. Returns whether
    /// it was inserted.
    pub fn add(&self, channel: Arc<Channel>) -> bool {
        let mut inner = self.inner.lock().expect("channel list lock poisoned");
        if inner.by_key.contains_key(channel.key()) {
            return false;
        }
        inner.by_key.insert(channel.key().clone(), channel.clone());
        inner.order.push(channel);
        true
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        let inner = self.inner.lock().expect("channel list lock poisoned");
        inner.by_key.get(key).cloned()
    }

    /// Snapshot of the channels in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        let inner = self.inner.lock().expect("channel list lock poisoned");
        inner.order.clone()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("channel list lock poisoned");
        inner.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ChannelClusterConfig;
    use crate::config::Options;
    use crate::cluster::storage::{MemoryLogStorage, MemoryMetadataStorage};

    fn channel(id: &str) -> Arc<Channel> {
        let opts = Arc::new(Options::new(
            crate::config::Config {
                node_id: 1,
                ..Default::default()
            },
            Arc::new(MemoryLogStorage::new()),
            Arc::new(MemoryMetadataStorage::new()),
        ));
        Channel::new(
            ChannelClusterConfig {
                channel_id: id.to_string(),
                channel_type: 2,
                term: 1,
                leader_id: 1,
                replicas: vec![1],
            },
            opts,
        )
        .unwrap()
    }

    #[test]
    fn add_then_get_roundtrips() {
        let list = ChannelList::new();
        let ch = channel("general");
        assert!(list.add(ch.clone()));
        let got = list.get(ch.key()).expect("channel present");
        assert!(Arc::ptr_eq(&got, &ch));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let list = ChannelList::new();
        let ch = channel("general");
        assert!(list.add(ch.clone()));
        assert!(!list.add(channel("general")));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let list = ChannelList::new();
        let names = ["alpha", "beta", "gamma"];
        for name in names {
            list.add(channel(name));
        }
        let snapshot = list.snapshot();
        let got: Vec<_> = snapshot
            .iter()
            .map(|ch| ch.key().as_str().to_string())
            .collect();
        assert_eq!(got, vec!["alpha#2", "beta#2", "gamma#2"]);
    }
}
