//! Per-channel replication and the action pipeline around it.

pub mod channel;
pub mod channel_list;
pub mod commit_wait;
pub mod error;
pub mod key;
pub mod log;
pub mod message;
pub mod pipeline;
pub mod proto;
pub mod reactor;
mod reactor_sub;
pub mod replica;
pub mod storage;
pub mod store_queue;
pub mod trace_record;
pub mod transport;

pub use channel::{Channel, ChannelClusterConfig};
pub use channel_list::ChannelList;
pub use commit_wait::{CommitSignal, CommitWait};
pub use error::ClusterError;
pub use key::{ChannelKey, NO_LEADER, NodeId};
pub use log::LogEntry;
pub use message::{ChannelMessage, PipelineStage, ReplicaMessage};
pub use pipeline::{
    ChannelInit, NoopPipeline, PermissionVerdict, PipelineDelegate, PipelineError,
};
pub use proto::{
    ProtoDecodeError, ProtoEncodeError, WIRE_VERSION, WireEnvelope, decode_envelope,
    encode_envelope,
};
pub use reactor::ChannelReactor;
pub use replica::{Action, ChannelReplica, Role};
pub use storage::{
    MemoryLogStorage, MemoryMetadataStorage, MessageLogStorage, MetadataStorage, StorageError,
};
pub use store_queue::LocalStoreQueue;
pub use trace_record::{NoopTraceObserver, SpanHandle, TraceObserver};
pub use transport::{NoopTransport, Transport};
