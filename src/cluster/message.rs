//! Replica messages: replication traffic, local storage completions and
//! pipeline stage completions, all funneled through the same `step` entry.

use bytes::Bytes;

use super::key::NodeId;
use super::log::LogEntry;

/// An instant-messaging payload moving through the channel's processing
/// pipeline. `payload` starts out encrypted and is replaced in place by the
/// decrypt stage; `message_seq` is assigned by the storage stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    pub message_id: u64,
    pub message_seq: u64,
    pub from_uid: String,
    pub payload: Bytes,
}

impl ChannelMessage {
    pub fn new(message_id: u64, from_uid: impl Into<String>, payload: Bytes) -> Self {
        Self {
            message_id,
            message_seq: 0,
            from_uid: from_uid.into(),
            payload,
        }
    }
}

/// The processing stages a message passes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    PayloadDecrypt,
    PermissionCheck,
    Storage,
    Deliver,
    Sendack,
    Forward,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Init => "init",
            PipelineStage::PayloadDecrypt => "payload_decrypt",
            PipelineStage::PermissionCheck => "permission_check",
            PipelineStage::Storage => "storage",
            PipelineStage::Deliver => "deliver",
            PipelineStage::Sendack => "sendack",
            PipelineStage::Forward => "forward",
        }
    }
}

/// Everything a channel replica can be stepped with.
///
/// Wire-bound kinds (`Sync`, `SyncResp`, `Vote`, `VoteResp`, `Heartbeat`,
/// `HeartbeatResp`) also travel between nodes; the rest are local to the
/// owning process.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplicaMessage {
    /// Leader-only: append caller-supplied logs at the tail.
    Propose { logs: Vec<LogEntry> },

    /// Force the given node to lead at the given term, bypassing election.
    AppointLeaderReq { term: u32, leader_id: NodeId },

    BecomeLeader {
        term: u32,
    },
    BecomeFollower {
        term: u32,
        leader_id: NodeId,
    },

    /// Follower asking the leader for logs starting at `index`. Doubles as
    /// the durable-replication ack: `index - 1` is known stored on `from`.
    Sync {
        from: NodeId,
        index: u64,
    },

    /// Leader shipping a log range (possibly empty) plus its commit state.
    SyncResp {
        from: NodeId,
        term: u32,
        prev_log_index: u64,
        prev_log_term: u32,
        committed_index: u64,
        logs: Vec<LogEntry>,
        trace_ids: Vec<[u8; 16]>,
        span_ids: Vec<[u8; 8]>,
    },

    /// Local log append completed durably up to `index`.
    StoreAppendResp { index: u64 },

    /// Apply of the committed range finished; `applied_index` is the new
    /// applied watermark.
    ApplyLogsResp { applied_index: u64 },

    Vote {
        from: NodeId,
        term: u32,
        last_log_index: u64,
        last_log_term: u32,
    },
    VoteResp {
        from: NodeId,
        term: u32,
        granted: bool,
    },
    Heartbeat {
        from: NodeId,
        term: u32,
        committed_index: u64,
    },
    HeartbeatResp {
        from: NodeId,
        term: u32,
    },

    Tick,

    /// Inbound IM messages entering the pipeline.
    MessagesReceived { messages: Vec<ChannelMessage> },

    /// Channel initialization finished.
    InitResp {
        tag_key: Option<String>,
    },
    PayloadDecryptResp {
        messages: Vec<ChannelMessage>,
    },
    PermissionCheckResp {
        messages: Vec<ChannelMessage>,
        denied: Vec<u64>,
    },
    StorageResp {
        messages: Vec<ChannelMessage>,
    },
    DeliverResp {
        message_ids: Vec<u64>,
    },
    SendackResp {
        message_ids: Vec<u64>,
    },
    ForwardResp {
        message_ids: Vec<u64>,
    },

    /// A stage attempt failed or was shed; the named messages become
    /// eligible for re-dispatch on the next ready.
    PipelineFailed {
        stage: PipelineStage,
        message_ids: Vec<u64>,
    },
}

impl ReplicaMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaMessage::Propose { .. } => "propose",
            ReplicaMessage::AppointLeaderReq { .. } => "appoint_leader_req",
            ReplicaMessage::BecomeLeader { .. } => "become_leader",
            ReplicaMessage::BecomeFollower { .. } => "become_follower",
            ReplicaMessage::Sync { .. } => "sync",
            ReplicaMessage::SyncResp { .. } => "sync_resp",
            ReplicaMessage::StoreAppendResp { .. } => "store_append_resp",
            ReplicaMessage::ApplyLogsResp { .. } => "apply_logs_resp",
            ReplicaMessage::Vote { .. } => "vote",
            ReplicaMessage::VoteResp { .. } => "vote_resp",
            ReplicaMessage::Heartbeat { .. } => "heartbeat",
            ReplicaMessage::HeartbeatResp { .. } => "heartbeat_resp",
            ReplicaMessage::Tick => "tick",
            ReplicaMessage::MessagesReceived { .. } => "messages_received",
            ReplicaMessage::InitResp { .. } => "init_resp",
            ReplicaMessage::PayloadDecryptResp { .. } => "payload_decrypt_resp",
            ReplicaMessage::PermissionCheckResp { .. } => "permission_check_resp",
            ReplicaMessage::StorageResp { .. } => "storage_resp",
            ReplicaMessage::DeliverResp { .. } => "deliver_resp",
            ReplicaMessage::SendackResp { .. } => "sendack_resp",
            ReplicaMessage::ForwardResp { .. } => "forward_resp",
            ReplicaMessage::PipelineFailed { .. } => "pipeline_failed",
        }
    }

    /// Whether this kind crosses the node boundary.
    pub fn is_wire(&self) -> bool {
        matches!(
            self,
            ReplicaMessage::Sync { .. }
                | ReplicaMessage::SyncResp { .. }
                | ReplicaMessage::Vote { .. }
                | ReplicaMessage::VoteResp { .. }
                | ReplicaMessage::Heartbeat { .. }
                | ReplicaMessage::HeartbeatResp { .. }
        )
    }
}
