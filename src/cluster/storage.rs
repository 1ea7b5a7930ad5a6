//! Pluggable log and metadata storage interfaces.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use super::key::ChannelKey;
use super::log::LogEntry;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(String),
}

/// Durable storage for the per-channel replicated message log.
///
/// Implementations are shared across channels; the channel key selects the
/// shard log. All calls may run on storage worker threads.
pub trait MessageLogStorage: Send + Sync {
    /// Durable append. Must be atomic per call: either every entry in the
    /// batch is persisted or none is.
    fn append_log(&self, key: &ChannelKey, logs: &[LogEntry]) -> Result<(), StorageError>;

    /// Drops every entry with `index >= from_index`. Used by followers
    /// reconciling a conflicting tail.
    fn truncate(&self, key: &ChannelKey, from_index: u64) -> Result<(), StorageError>;

    /// Entries with `from <= index <= to`, in index order.
    fn read(&self, key: &ChannelKey, from: u64, to: u64) -> Result<Vec<LogEntry>, StorageError>;

    /// Highest persisted index, 0 when the log is empty.
    fn last_index(&self, key: &ChannelKey) -> Result<u64, StorageError>;
}

/// Durable local metadata, currently just the applied index per channel.
pub trait MetadataStorage: Send + Sync {
    fn set_applied_index(&self, key: &ChannelKey, index: u64) -> Result<(), StorageError>;

    /// 0 when the channel has never applied anything.
    fn get_applied_index(&self, key: &ChannelKey) -> Result<u64, StorageError>;
}

/// In-memory log storage for tests and single-process runs.
#[derive(Default)]
pub struct MemoryLogStorage {
    logs: Mutex<HashMap<ChannelKey, Vec<LogEntry>>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageLogStorage for MemoryLogStorage {
    fn append_log(&self, key: &ChannelKey, logs: &[LogEntry]) -> Result<(), StorageError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut shards = self.logs.lock().expect("log storage lock poisoned");
        let shard = shards.entry(key.clone()).or_default();
        let last = shard.last().map(|log| log.index).unwrap_or(0);
        if logs[0].index != last + 1 {
            return Err(StorageError::Backend(format!(
                "non-contiguous append for {key}: last {last}, got {}",
                logs[0].index
            )));
        }
        shard.extend_from_slice(logs);
        Ok(())
    }

    fn truncate(&self, key: &ChannelKey, from_index: u64) -> Result<(), StorageError> {
        let mut shards = self.logs.lock().expect("log storage lock poisoned");
        if let Some(shard) = shards.get_mut(key) {
            shard.retain(|log| log.index < from_index);
        }
        Ok(())
    }

    fn read(&self, key: &ChannelKey, from: u64, to: u64) -> Result<Vec<LogEntry>, StorageError> {
        let shards = self.logs.lock().expect("log storage lock poisoned");
        Ok(shards
            .get(key)
            .map(|shard| {
                shard
                    .iter()
                    .filter(|log| log.index >= from && log.index <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn last_index(&self, key: &ChannelKey) -> Result<u64, StorageError> {
        let shards = self.logs.lock().expect("log storage lock poisoned");
        Ok(shards
            .get(key)
            .and_then(|shard| shard.last())
            .map(|log| log.index)
            .unwrap_or(0))
    }
}

/// In-memory metadata storage for tests and single-process runs.
#[derive(Default)]
pub struct MemoryMetadataStorage {
    applied: Mutex<HashMap<ChannelKey, u64>>,
}

impl MemoryMetadataStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStorage for MemoryMetadataStorage {
    fn set_applied_index(&self, key: &ChannelKey, index: u64) -> Result<(), StorageError> {
        let mut applied = self.applied.lock().expect("metadata lock poisoned");
        applied.insert(key.clone(), index);
        Ok(())
    }

    fn get_applied_index(&self, key: &ChannelKey) -> Result<u64, StorageError> {
        let applied = self.applied.lock().expect("metadata lock poisoned");
        Ok(applied.get(key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entries(range: std::ops::RangeInclusive<u64>) -> Vec<LogEntry> {
        range
            .map(|index| LogEntry::new(index, 1, Bytes::from_static(b"payload")))
            .collect()
    }

    #[test]
    fn append_requires_contiguity() {
        let store = MemoryLogStorage::new();
        let key = ChannelKey::new("general", 2);
        store.append_log(&key, &entries(1..=3)).unwrap();
        assert!(store.append_log(&key, &entries(5..=5)).is_err());
        assert_eq!(store.last_index(&key).unwrap(), 3);
    }

    #[test]
    fn truncate_drops_tail() {
        let store = MemoryLogStorage::new();
        let key = ChannelKey::new("general", 2);
        store.append_log(&key, &entries(1..=5)).unwrap();
        store.truncate(&key, 3).unwrap();
        assert_eq!(store.last_index(&key).unwrap(), 2);
        assert_eq!(store.read(&key, 1, 10).unwrap().len(), 2);
    }

    #[test]
    fn applied_index_defaults_to_zero() {
        let store = MemoryMetadataStorage::new();
        let key = ChannelKey::new("general", 2);
        assert_eq!(store.get_applied_index(&key).unwrap(), 0);
        store.set_applied_index(&key, 9).unwrap();
        assert_eq!(store.get_applied_index(&key).unwrap(), 9);
    }
}
