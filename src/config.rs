//! Cluster configuration: the serde-backed knob set plus the injected
//! collaborator seams.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{
    ChannelKey, ClusterError, LogEntry, MessageLogStorage, MetadataStorage, NodeId, NoopPipeline,
    NoopTraceObserver, NoopTransport, PipelineDelegate, TraceObserver, Transport,
};

/// Plain configuration, loadable from a file. Every field has a default so
/// partial configs merge cleanly; `node_id` is the one field an operator
/// must always set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// This node's identity. Required, never zero.
    pub node_id: NodeId,

    /// Cluster transport bind address.
    pub listen_addr: String,

    /// Seed node id to address map.
    pub init_nodes: BTreeMap<NodeId, String>,

    /// Replica tick interval. Heartbeats go out once per tick and the
    /// election timeout is counted in ticks, so this is the base unit of
    /// all replication timing.
    pub heartbeat_ms: u64,

    /// Ticks without a leader heartbeat before a follower starts an
    /// election (randomized up to 2x).
    pub election_timeout_tick: u32,

    /// Target replicas per channel, leader included.
    pub channel_replica_count: u16,

    /// Slot placement grid.
    pub slot_count: u32,
    pub slot_replica_count: u16,

    /// Local persistence root.
    pub data_dir: PathBuf,

    /// Reactor shards; channel ownership is `hash(key) % shard_count`.
    pub shard_count: usize,

    /// Bound of each channel's inbound replica-message queue.
    pub receive_queue_length: usize,

    /// Hard cap on `step_wait`, independent of the caller.
    pub step_wait_timeout_ms: u64,

    /// Most messages moved per pipeline stage per ready.
    pub max_ready_batch: usize,

    /// Per-stage worker pool sizing.
    pub stage_queue_depth: usize,
    pub stage_concurrency: usize,

    /// Workers executing local log append and apply.
    pub storage_worker_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: "0.0.0.0:1001".to_string(),
            init_nodes: BTreeMap::new(),
            heartbeat_ms: 500,
            election_timeout_tick: 6,
            channel_replica_count: 3,
            slot_count: 256,
            slot_replica_count: 3,
            data_dir: PathBuf::new(),
            shard_count: 16,
            receive_queue_length: 1024,
            step_wait_timeout_ms: 5_000,
            max_ready_batch: 50,
            stage_queue_depth: 1024,
            stage_concurrency: 4,
            storage_worker_count: 4,
        }
    }
}

impl Config {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn step_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.step_wait_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.node_id == 0 {
            return Err(ClusterError::InvalidArg {
                reason: "node_id is required".to_string(),
            });
        }
        if self.shard_count == 0 {
            return Err(ClusterError::InvalidArg {
                reason: "shard_count must be at least 1".to_string(),
            });
        }
        if self.heartbeat_ms == 0 {
            return Err(ClusterError::InvalidArg {
                reason: "heartbeat_ms must be nonzero".to_string(),
            });
        }
        if self.election_timeout_tick == 0 {
            return Err(ClusterError::InvalidArg {
                reason: "election_timeout_tick must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}

/// Invoked when a channel's leader changes, with the new leader id.
pub type LeaderChangeFn = dyn Fn(&ChannelKey, NodeId) + Send + Sync;

/// Applies channel metadata log entries after commit.
pub type ChannelMetaApplyFn =
    dyn Fn(&str, u8, &[LogEntry]) -> Result<(), ClusterError> + Send + Sync;

/// A `Config` plus the collaborators the core calls out to. Storage is
/// mandatory; everything else defaults to a no-op suitable for tests and
/// single-node runs.
#[derive(Clone)]
pub struct Options {
    pub config: Config,
    pub message_log_storage: Arc<dyn MessageLogStorage>,
    pub metadata_storage: Arc<dyn MetadataStorage>,
    pub transport: Arc<dyn Transport>,
    pub pipeline: Arc<dyn PipelineDelegate>,
    pub trace: Arc<dyn TraceObserver>,
    pub on_leader_change: Option<Arc<LeaderChangeFn>>,
    pub on_channel_meta_apply: Option<Arc<ChannelMetaApplyFn>>,
}

impl Options {
    pub fn new(
        config: Config,
        message_log_storage: Arc<dyn MessageLogStorage>,
        metadata_storage: Arc<dyn MetadataStorage>,
    ) -> Self {
        Self {
            config,
            message_log_storage,
            metadata_storage,
            transport: Arc::new(NoopTransport),
            pipeline: Arc::new(NoopPipeline),
            trace: Arc::new(NoopTraceObserver),
            on_leader_change: None,
            on_channel_meta_apply: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn PipelineDelegate>) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceObserver>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_on_leader_change(mut self, callback: Arc<LeaderChangeFn>) -> Self {
        self.on_leader_change = Some(callback);
        self
    }

    pub fn with_on_channel_meta_apply(mut self, callback: Arc<ChannelMetaApplyFn>) -> Self {
        self.on_channel_meta_apply = Some(callback);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"node_id": 7, "heartbeat_ms": 100}"#).unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.heartbeat_ms, 100);
        assert_eq!(config.election_timeout_tick, 6);
        assert_eq!(config.channel_replica_count, 3);
        assert_eq!(config.slot_count, 256);
        assert_eq!(config.step_wait_timeout_ms, 5_000);
    }

    #[test]
    fn validate_rejects_missing_node_id() {
        let config = Config::default();
        assert!(config.validate().is_err());
        let config = Config {
            node_id: 1,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
