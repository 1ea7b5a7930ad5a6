#![forbid(unsafe_code)]

//! Per-channel replication and action-pipeline core for the Huddle
//! clustered messaging server.
//!
//! Every conversation is an independently replicated state machine: the
//! leader accepts proposals, orders them into a log, replicates to its
//! followers, and once an entry commits the surrounding pipeline decrypts,
//! permission-checks, stores, delivers and acknowledges the messages it
//! carries. The [`cluster::ChannelReactor`] schedules thousands of such
//! channels across a fixed set of shard loops; storage, transport and the
//! pipeline stages are injected via [`config::Options`].

pub mod cluster;
pub mod config;
pub mod metrics;
pub mod telemetry;

pub use cluster::{
    Action, Channel, ChannelClusterConfig, ChannelKey, ChannelMessage, ChannelReactor,
    ChannelReplica, ClusterError, CommitSignal, LogEntry, MemoryLogStorage,
    MemoryMetadataStorage, MessageLogStorage, MetadataStorage, NO_LEADER, NodeId, NoopPipeline,
    NoopTraceObserver, NoopTransport, PipelineDelegate, PipelineStage, ReplicaMessage, Role,
    SpanHandle, StorageError, TraceObserver, Transport, WireEnvelope,
};
pub use config::{Config, Options};

pub type Result<T> = std::result::Result<T, ClusterError>;
