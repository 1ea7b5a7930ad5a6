//! Channel lifecycle, mutex-guarded stepping, the proposer API and the
//! local storage side-effect handlers around one `ChannelReplica`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, after, unbounded};
use serde::{Deserialize, Serialize};

use crate::config::Options;
use crate::metrics;

use super::commit_wait::{CommitSignal, CommitWait};
use super::error::ClusterError;
use super::key::{ChannelKey, NO_LEADER, NodeId};
use super::log::LogEntry;
use super::message::{ChannelMessage, ReplicaMessage};
use super::replica::{Action, ChannelReplica};
use super::store_queue::LocalStoreQueue;
use super::trace_record::{SpanHandle, TraceRecord};

/// Cluster placement of one channel, owned by the external configuration
/// service and pushed down via `update_cluster_config`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelClusterConfig {
    pub channel_id: String,
    pub channel_type: u8,
    pub term: u32,
    pub leader_id: NodeId,
    pub replicas: Vec<NodeId>,
}

/// Work executed on the reactor's storage worker pool. Holds the channel
/// weakly so a destroyed channel turns in-flight completions into no-ops.
pub(crate) enum StoreJob {
    Append {
        ch: Weak<Channel>,
        logs: Vec<LogEntry>,
    },
    Apply {
        ch: Weak<Channel>,
        applied_index: u64,
        committed_index: u64,
    },
}

/// Hooks into the shard that owns this channel, set once at add time.
pub(crate) struct ShardBinding {
    pub advance_tx: Sender<()>,
    pub store_tx: Sender<StoreJob>,
}

struct MessageQueue {
    capacity: usize,
    entries: Mutex<VecDeque<ReplicaMessage>>,
}

impl MessageQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn add(&self, msg: ReplicaMessage) -> Result<(), ClusterError> {
        let mut entries = self.entries.lock().expect("message queue lock poisoned");
        if entries.len() >= self.capacity {
            metrics::inbound_queue_full();
            return Err(ClusterError::QueueFull);
        }
        entries.push_back(msg);
        Ok(())
    }

    fn drain(&self) -> Vec<ReplicaMessage> {
        let mut entries = self.entries.lock().expect("message queue lock poisoned");
        entries.drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .expect("message queue lock poisoned")
            .is_empty()
    }
}

/// One replicated channel: a `ChannelReplica` plus everything the reactor
/// needs around it.
pub struct Channel {
    key: ChannelKey,
    channel_id: String,
    channel_type: u8,
    opts: Arc<Options>,

    replica: Mutex<ChannelReplica>,
    cluster_config: Mutex<ChannelClusterConfig>,

    destroyed: AtomicBool,
    last_activity: Mutex<Instant>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,

    commit_wait: CommitWait,
    message_queue: MessageQueue,
    append_queue: Mutex<LocalStoreQueue>,
    apply_queue: Mutex<LocalStoreQueue>,
    trace_record: TraceRecord,

    binding: OnceLock<ShardBinding>,
}

impl Channel {
    /// Builds the channel, seeding the replica from durable local state and
    /// adopting the role the cluster config assigns.
    pub fn new(
        cluster_config: ChannelClusterConfig,
        opts: Arc<Options>,
    ) -> Result<Arc<Self>, ClusterError> {
        let key = ChannelKey::new(&cluster_config.channel_id, cluster_config.channel_type);
        let applied_index = opts.metadata_storage.get_applied_index(&key)?;
        let last_log_index = opts.message_log_storage.last_index(&key)?;
        let last_log_term = if last_log_index > 0 {
            opts.message_log_storage
                .read(&key, last_log_index, last_log_index)?
                .first()
                .map(|log| log.term)
                .unwrap_or(0)
        } else {
            0
        };

        let mut replica = ChannelReplica::new(
            opts.config.node_id,
            key.clone(),
            cluster_config.replicas.clone(),
            applied_index,
            last_log_index,
            last_log_term,
            opts.config.election_timeout_tick,
            opts.config.max_ready_batch,
        );
        if cluster_config.leader_id != NO_LEADER {
            let msg = if cluster_config.leader_id == opts.config.node_id {
                ReplicaMessage::BecomeLeader {
                    term: cluster_config.term,
                }
            } else {
                ReplicaMessage::BecomeFollower {
                    term: cluster_config.term,
                    leader_id: cluster_config.leader_id,
                }
            };
            replica.step(msg)?;
        }

        let (done_tx, done_rx) = unbounded();
        let receive_queue_length = opts.config.receive_queue_length;
        Ok(Arc::new(Self {
            key,
            channel_id: cluster_config.channel_id.clone(),
            channel_type: cluster_config.channel_type,
            opts,
            replica: Mutex::new(replica),
            cluster_config: Mutex::new(cluster_config),
            destroyed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            commit_wait: CommitWait::new(),
            message_queue: MessageQueue::new(receive_queue_length),
            append_queue: Mutex::new(LocalStoreQueue::new()),
            apply_queue: Mutex::new(LocalStoreQueue::new()),
            trace_record: TraceRecord::new(),
            binding: OnceLock::new(),
        }))
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn channel_type(&self) -> u8 {
        self.channel_type
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("activity lock poisoned")
    }

    pub fn is_leader(&self) -> bool {
        self.replica().is_leader()
    }

    pub fn leader_id(&self) -> NodeId {
        self.replica().leader_id()
    }

    pub fn term(&self) -> u32 {
        self.replica().term()
    }

    pub fn last_log_index(&self) -> u64 {
        self.replica().last_log_index()
    }

    pub fn committed_index(&self) -> u64 {
        self.replica().committed_index()
    }

    pub fn applied_index(&self) -> u64 {
        self.replica().applied_index()
    }

    pub fn cluster_config(&self) -> ChannelClusterConfig {
        self.cluster_config
            .lock()
            .expect("cluster config lock poisoned")
            .clone()
    }

    fn replica(&self) -> std::sync::MutexGuard<'_, ChannelReplica> {
        self.replica.lock().expect("replica lock poisoned")
    }

    pub(crate) fn bind(&self, binding: ShardBinding) {
        let _ = self.binding.set(binding);
    }

    /// Pokes the owning shard loop; no-op when not yet added to a reactor.
    pub(crate) fn advance(&self) {
        if let Some(binding) = self.binding.get() {
            let _ = binding.advance_tx.try_send(());
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    fn notify_leader_change(&self, before: NodeId, after: NodeId) {
        if before != after
            && after != NO_LEADER
            && let Some(callback) = &self.opts.on_leader_change
        {
            callback(&self.key, after);
        }
    }

    fn step_inner(
        &self,
        replica: &mut ChannelReplica,
        msg: ReplicaMessage,
    ) -> Result<(), ClusterError> {
        if self.is_destroyed() {
            return Err(ClusterError::Destroyed);
        }
        self.touch();
        replica.step(msg)
    }

    /// Steps the replica under the channel mutex.
    pub fn step_lock(&self, msg: ReplicaMessage) -> Result<(), ClusterError> {
        let (result, before, after) = {
            let mut replica = self.replica();
            let before = replica.leader_id();
            let result = self.step_inner(&mut replica, msg);
            (result, before, replica.leader_id())
        };
        self.notify_leader_change(before, after);
        result
    }

    pub(crate) fn tick(&self) {
        if self.is_destroyed() {
            return;
        }
        let (before, after) = {
            let mut replica = self.replica();
            let before = replica.leader_id();
            replica.tick();
            (before, replica.leader_id())
        };
        self.notify_leader_change(before, after);
    }

    pub(crate) fn has_ready(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.replica().has_ready()
    }

    pub(crate) fn ready(&self) -> Vec<Action> {
        if self.is_destroyed() {
            return Vec::new();
        }
        self.replica().ready()
    }

    /// Single-entry propose without waiting for commit. Returns the index
    /// the entry was assigned.
    pub fn propose(&self, data: Bytes) -> Result<u64, ClusterError> {
        let index = {
            let mut replica = self.replica();
            if self.is_destroyed() {
                return Err(ClusterError::Destroyed);
            }
            let index = replica.last_log_index() + 1;
            let term = replica.term();
            self.step_inner(
                &mut replica,
                ReplicaMessage::Propose {
                    logs: vec![LogEntry::new(index, term, data)],
                },
            )?;
            index
        };
        self.advance();
        Ok(index)
    }

    pub fn propose_and_wait_commit(
        &self,
        data: Bytes,
        timeout: Duration,
    ) -> Result<u64, ClusterError> {
        let indices = self.propose_and_wait_commits(vec![data], timeout)?;
        indices
            .first()
            .copied()
            .ok_or_else(|| ClusterError::invalid_message("no index assigned"))
    }

    /// Assigns contiguous indices to `data`, steps the propose and blocks
    /// until the last index commits, the timeout passes or the channel is
    /// destroyed. Indices are returned only on commit.
    ///
    /// Concurrent proposers serialize on the channel mutex during index
    /// assignment, so each sees a disjoint contiguous range.
    pub fn propose_and_wait_commits(
        &self,
        data: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<Vec<u64>, ClusterError> {
        if data.is_empty() {
            return Err(ClusterError::invalid_arg("propose with empty data"));
        }
        let start = Instant::now();

        let (wait_rx, first_index, last_index, span) = {
            let mut replica = self.replica();
            if self.is_destroyed() {
                return Err(ClusterError::Destroyed);
            }
            let term = replica.term();
            let first_index = replica.last_log_index() + 1;
            let last_index = first_index + data.len() as u64 - 1;
            let logs: Vec<LogEntry> = data
                .iter()
                .enumerate()
                .map(|(i, d)| LogEntry::new(first_index + i as u64, term, d.clone()))
                .collect();

            let wait_rx = self.commit_wait.add_wait_index(last_index)?;
            let span = self
                .opts
                .trace
                .start_span("propose.logs", &self.key, first_index, last_index);
            self.trace_record
                .add_propose_range(first_index, last_index, span);

            if let Err(err) = self.step_inner(&mut replica, ReplicaMessage::Propose { logs }) {
                self.trace_record
                    .remove_propose_range(first_index, last_index);
                self.opts.trace.end_span(span);
                metrics::propose_err(start.elapsed());
                return Err(err);
            }
            (wait_rx, first_index, last_index, span)
        };
        self.advance();

        let done_rx = self.done_rx.clone();
        let timeout_rx = after(timeout);
        let result = crossbeam::select! {
            recv(wait_rx) -> signal => match signal {
                Ok(CommitSignal::Committed) => Ok((first_index..=last_index).collect()),
                Ok(CommitSignal::Stopped) | Err(_) => Err(ClusterError::Stopped),
            },
            recv(timeout_rx) -> _ => Err(ClusterError::Timeout),
            recv(done_rx) -> _ => Err(ClusterError::Stopped),
        };

        self.trace_record
            .remove_propose_range(first_index, last_index);
        self.opts.trace.end_span(span);
        match &result {
            Ok(_) => metrics::propose_ok(start.elapsed()),
            Err(_) => metrics::propose_err(start.elapsed()),
        }
        result
    }

    pub fn appoint_leader(&self, term: u32) -> Result<(), ClusterError> {
        self.appoint_leader_to(term, self.opts.config.node_id)
    }

    pub fn appoint_leader_to(&self, term: u32, to: NodeId) -> Result<(), ClusterError> {
        let result = self.step_lock(ReplicaMessage::AppointLeaderReq {
            term,
            leader_id: to,
        });
        self.advance();
        result
    }

    /// Installs a new cluster config and adopts the role it assigns.
    pub fn update_cluster_config(&self, config: ChannelClusterConfig) -> Result<(), ClusterError> {
        {
            let mut stored = self
                .cluster_config
                .lock()
                .expect("cluster config lock poisoned");
            *stored = config.clone();
        }
        let (result, before, after) = {
            let mut replica = self.replica();
            let before = replica.leader_id();
            replica.set_replicas(config.replicas.clone());
            let msg = if config.leader_id == self.opts.config.node_id {
                ReplicaMessage::BecomeLeader { term: config.term }
            } else {
                ReplicaMessage::BecomeFollower {
                    term: config.term,
                    leader_id: config.leader_id,
                }
            };
            let result = self.step_inner(&mut replica, msg);
            (result, before, replica.leader_id())
        };
        self.notify_leader_change(before, after);
        self.advance();
        result
    }

    /// Inbound IM messages entering this channel's pipeline.
    pub fn submit_messages(&self, messages: Vec<ChannelMessage>) -> Result<(), ClusterError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.step_lock(ReplicaMessage::MessagesReceived { messages })?;
        self.advance();
        Ok(())
    }

    /// Entry point for the transport: enqueues an inbound replica message.
    pub fn handle_message(&self, msg: ReplicaMessage) -> Result<(), ClusterError> {
        if self.is_destroyed() {
            return Err(ClusterError::Destroyed);
        }
        self.touch();
        self.record_wire_trace(&msg);
        self.message_queue.add(msg)?;
        self.advance();
        Ok(())
    }

    fn record_wire_trace(&self, msg: &ReplicaMessage) {
        match msg {
            ReplicaMessage::Sync { from, index } => {
                for handle in self.trace_record.take_sync_spans(*from, *index) {
                    self.opts.trace.end_span(handle);
                }
                let span = self
                    .opts
                    .trace
                    .start_span("logs.sync", &self.key, *index, *index);
                self.trace_record.add_sync_span(*from, *index, span);
            }
            ReplicaMessage::SyncResp {
                prev_log_index,
                logs,
                trace_ids,
                span_ids,
                ..
            } if !logs.is_empty() => {
                let first = prev_log_index + 1;
                let last = logs.last().map(|log| log.index).unwrap_or(first);
                for (trace_id, span_id) in trace_ids.iter().zip(span_ids.iter()) {
                    self.trace_record.add_propose_range(
                        first,
                        last,
                        SpanHandle {
                            trace_id: *trace_id,
                            span_id: *span_id,
                        },
                    );
                }
            }
            _ => {}
        }
    }

    /// Attaches propose trace identities to an outbound sync response so
    /// the follower can link its append spans to the original propose.
    pub(crate) fn enrich_wire(&self, msg: &mut ReplicaMessage) {
        if let ReplicaMessage::SyncResp {
            prev_log_index,
            logs,
            trace_ids,
            span_ids,
            ..
        } = msg
            && !logs.is_empty()
        {
            let first = *prev_log_index + 1;
            let last = logs.last().map(|log| log.index).unwrap_or(first);
            for handle in self.trace_record.propose_in_range(first, last) {
                trace_ids.push(handle.trace_id);
                span_ids.push(handle.span_id);
            }
        }
    }

    /// Drains the inbound queue into the replica. Called by the owning
    /// shard during readys.
    pub(crate) fn handle_received_messages(&self) -> Result<(), ClusterError> {
        if self.is_destroyed() {
            return Err(ClusterError::Destroyed);
        }
        if self.message_queue.is_empty() {
            return Ok(());
        }
        for msg in self.message_queue.drain() {
            if let Err(err) = self.step_lock(msg) {
                tracing::warn!(
                    target: "cluster",
                    channel = %self.key,
                    "dropping inbound message: {err}"
                );
            }
        }
        Ok(())
    }

    /// Handles a `StoreAppend` action: parks the response in the append
    /// queue and hands the durable write to the storage workers.
    pub(crate) fn handle_store_append(self: &Arc<Self>, logs: Vec<LogEntry>) {
        let Some(last) = logs.last() else {
            return;
        };
        let last_index = last.index;
        {
            let mut queue = self.append_queue.lock().expect("append queue lock poisoned");
            queue.add(ReplicaMessage::StoreAppendResp { index: last_index }, last_index);
        }
        self.submit_store_job(StoreJob::Append {
            ch: Arc::downgrade(self),
            logs,
        });
    }

    /// Handles an `ApplyLogs` action: parks the response in the apply queue
    /// and hands commit-wait signalling plus the applied-index write to the
    /// storage workers.
    pub(crate) fn handle_apply_logs_req(
        self: &Arc<Self>,
        applied_index: u64,
        committed_index: u64,
    ) {
        if committed_index == 0 || applied_index >= committed_index {
            return;
        }
        {
            let mut queue = self.apply_queue.lock().expect("apply queue lock poisoned");
            queue.add(
                ReplicaMessage::ApplyLogsResp {
                    applied_index: committed_index,
                },
                committed_index,
            );
        }
        self.submit_store_job(StoreJob::Apply {
            ch: Arc::downgrade(self),
            applied_index,
            committed_index,
        });
    }

    fn submit_store_job(self: &Arc<Self>, job: StoreJob) {
        match self.binding.get() {
            Some(binding) => {
                if let Err(err) = binding.store_tx.send(job) {
                    // Reactor shut down; finish the write on this thread so
                    // the log never loses an accepted append.
                    run_store_job(err.into_inner());
                }
            }
            None => run_store_job(job),
        }
    }

    /// Re-feeds completed storage responses into the replica, head first
    /// and strictly in issue order.
    pub(crate) fn handle_local_store_msgs(&self) -> Result<(), ClusterError> {
        if self.is_destroyed() {
            return Err(ClusterError::Destroyed);
        }
        loop {
            let msg = {
                let mut queue = self.append_queue.lock().expect("append queue lock poisoned");
                queue.remove_first()
            };
            match msg {
                Some(msg) => self.step_lock(msg)?,
                None => break,
            }
        }
        loop {
            let msg = {
                let mut queue = self.apply_queue.lock().expect("apply queue lock poisoned");
                queue.remove_first()
            };
            match msg {
                Some(msg) => self.step_lock(msg)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Irreversibly destroys the channel: releases every commit waiter with
    /// `Stopped` and fails all further operations. Idempotent.
    pub fn make_destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let done_tx = self.done_tx.lock().expect("done lock poisoned").take();
        drop(done_tx);
        self.commit_wait.destroy();
        tracing::debug!(target: "cluster", channel = %self.key, "channel destroyed");
    }
}

/// Executes one storage job. Runs on a storage worker, or inline when the
/// channel is not bound to a reactor.
pub(crate) fn run_store_job(job: StoreJob) {
    match job {
        StoreJob::Append { ch, logs } => run_append_job(&ch, logs),
        StoreJob::Apply {
            ch,
            applied_index,
            committed_index,
        } => run_apply_job(&ch, applied_index, committed_index),
    }
}

fn run_append_job(ch: &Weak<Channel>, logs: Vec<LogEntry>) {
    let Some(ch) = ch.upgrade() else {
        return;
    };
    if ch.is_destroyed() {
        return;
    }
    let (Some(first), Some(last)) = (logs.first(), logs.last()) else {
        return;
    };
    let (first_index, last_index) = (first.index, last.index);
    let start = Instant::now();
    let storage = &ch.opts.message_log_storage;

    // A new leader may override our tail: drop the conflicting suffix
    // before appending. Failures here are as fatal as append failures.
    let existing_last = match storage.last_index(&ch.key) {
        Ok(index) => index,
        Err(err) => fatal_storage(&ch.key, "read last index", &err),
    };
    if first_index <= existing_last
        && let Err(err) = storage.truncate(&ch.key, first_index)
    {
        fatal_storage(&ch.key, "truncate conflicting tail", &err);
    }
    if let Err(err) = storage.append_log(&ch.key, &logs) {
        metrics::append_err(start.elapsed());
        fatal_storage(&ch.key, "append log", &err);
    }
    metrics::append_ok(start.elapsed());

    if !ch.trace_record.propose_in_range(first_index, last_index).is_empty() {
        let append_span =
            ch.opts
                .trace
                .start_span("logs.append", &ch.key, first_index, last_index);
        ch.opts.trace.end_span(append_span);
        let commit_span =
            ch.opts
                .trace
                .start_span("logs.commit", &ch.key, first_index, last_index);
        ch.trace_record
            .add_commit_range(first_index, last_index, commit_span);
    }

    let set = ch
        .append_queue
        .lock()
        .expect("append queue lock poisoned")
        .set_stored(last_index);
    assert!(set, "append completion for unknown index {last_index}");
    ch.advance();
}

fn run_apply_job(ch: &Weak<Channel>, applied_index: u64, committed_index: u64) {
    let Some(ch) = ch.upgrade() else {
        return;
    };
    if ch.is_destroyed() {
        return;
    }
    let start = Instant::now();

    for handle in ch
        .trace_record
        .take_commit_in_range(applied_index, committed_index)
    {
        ch.opts.trace.end_span(handle);
    }

    ch.commit_wait.commit_index(committed_index);

    // The applied index is idempotent metadata: a failed write is logged
    // and skipped, the next apply re-advances it.
    if let Err(err) = ch
        .opts
        .metadata_storage
        .set_applied_index(&ch.key, committed_index)
    {
        tracing::warn!(
            target: "cluster",
            channel = %ch.key,
            committed_index,
            "set applied index failed: {err}"
        );
    }

    if let Some(callback) = &ch.opts.on_channel_meta_apply {
        match ch
            .opts
            .message_log_storage
            .read(&ch.key, applied_index + 1, committed_index)
        {
            Ok(logs) => {
                if let Err(err) = callback(&ch.channel_id, ch.channel_type, &logs) {
                    tracing::warn!(
                        target: "cluster",
                        channel = %ch.key,
                        "channel meta apply failed: {err}"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "cluster",
                    channel = %ch.key,
                    "reading committed range for apply failed: {err}"
                );
            }
        }
    }

    let set = ch
        .apply_queue
        .lock()
        .expect("apply queue lock poisoned")
        .set_stored(committed_index);
    assert!(set, "apply completion for unknown index {committed_index}");
    metrics::apply_ok(start.elapsed());
    ch.advance();
}

fn fatal_storage(key: &ChannelKey, operation: &str, err: &dyn std::fmt::Display) -> ! {
    // A partial append compromises the log; continuing would let this
    // replica diverge from the quorum.
    tracing::error!(
        target: "cluster",
        channel = %key,
        "fatal log storage failure during {operation}: {err}"
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::storage::{MemoryLogStorage, MemoryMetadataStorage};
    use crate::config::{Config, Options};
    use std::sync::atomic::AtomicU64;

    fn options(node_id: NodeId) -> Arc<Options> {
        options_with(node_id, Config::default())
    }

    fn options_with(node_id: NodeId, mut config: Config) -> Arc<Options> {
        config.node_id = node_id;
        Arc::new(Options::new(
            config,
            Arc::new(MemoryLogStorage::new()),
            Arc::new(MemoryMetadataStorage::new()),
        ))
    }

    fn leader_config(leader: NodeId, replicas: Vec<NodeId>) -> ChannelClusterConfig {
        ChannelClusterConfig {
            channel_id: "general".to_string(),
            channel_type: 2,
            term: 1,
            leader_id: leader,
            replicas,
        }
    }

    /// Drives an unbound channel's ready loop inline until it goes quiet,
    /// standing in for the reactor.
    fn drain(ch: &Arc<Channel>) {
        for _ in 0..32 {
            let _ = ch.handle_received_messages();
            let _ = ch.handle_local_store_msgs();
            if !ch.has_ready() {
                return;
            }
            for action in ch.ready() {
                match action {
                    Action::StoreAppend { logs } => ch.handle_store_append(logs),
                    Action::ApplyLogs {
                        applied_index,
                        committed_index,
                    } => ch.handle_apply_logs_req(applied_index, committed_index),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn empty_propose_is_rejected_without_touching_the_replica() {
        let ch = Channel::new(leader_config(1, vec![1]), options(1)).unwrap();
        let before = ch.last_log_index();
        let err = ch
            .propose_and_wait_commits(Vec::new(), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidArg { .. }));
        assert_eq!(ch.last_log_index(), before);
    }

    #[test]
    fn propose_on_follower_returns_not_leader() {
        let ch = Channel::new(leader_config(2, vec![1, 2, 3]), options(1)).unwrap();
        let err = ch
            .propose_and_wait_commits(
                vec![Bytes::from_static(b"hello")],
                Duration::from_millis(10),
            )
            .unwrap_err();
        assert_eq!(err, ClusterError::NotLeader { leader_id: 2 });
    }

    #[test]
    fn singleton_propose_commits_and_persists_applied_index() {
        let opts = options(1);
        let ch = Channel::new(leader_config(1, vec![1]), opts.clone()).unwrap();

        let driver = {
            let ch = ch.clone();
            std::thread::spawn(move || {
                ch.propose_and_wait_commits(
                    vec![
                        Bytes::from_static(b"a"),
                        Bytes::from_static(b"b"),
                        Bytes::from_static(b"c"),
                    ],
                    Duration::from_secs(2),
                )
            })
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !driver.is_finished() && Instant::now() < deadline {
            drain(&ch);
            std::thread::sleep(Duration::from_millis(1));
        }
        let indices = driver.join().expect("join").expect("commit");
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(ch.committed_index(), 3);

        drain(&ch);
        assert_eq!(ch.applied_index(), 3);
        assert_eq!(
            opts.metadata_storage.get_applied_index(ch.key()).unwrap(),
            3
        );
        assert_eq!(opts.message_log_storage.last_index(ch.key()).unwrap(), 3);
    }

    #[test]
    fn concurrent_proposers_get_disjoint_contiguous_ranges() {
        let ch = Channel::new(leader_config(1, vec![1]), options(1)).unwrap();
        let mut joins = Vec::new();
        for _ in 0..4 {
            let ch = ch.clone();
            joins.push(std::thread::spawn(move || {
                ch.propose_and_wait_commits(
                    vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")],
                    Duration::from_secs(2),
                )
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while joins.iter().any(|join| !join.is_finished()) && Instant::now() < deadline {
            drain(&ch);
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut all: Vec<u64> = Vec::new();
        for join in joins {
            let indices = join.join().expect("join").expect("commit");
            assert_eq!(indices.len(), 2);
            assert_eq!(indices[1], indices[0] + 1);
            all.extend(indices);
        }
        all.sort_unstable();
        assert_eq!(all, (1..=8).collect::<Vec<u64>>());
    }

    #[test]
    fn propose_times_out_without_quorum_and_late_commit_is_safe() {
        // Minority leader: peers never ack, so nothing commits.
        let ch = Channel::new(leader_config(1, vec![1, 2, 3]), options(1)).unwrap();
        let started = Instant::now();
        let err = ch
            .propose_and_wait_commits(
                vec![Bytes::from_static(b"stranded")],
                Duration::from_millis(50),
            )
            .unwrap_err();
        assert_eq!(err, ClusterError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));

        // The waiter is gone; a late commit at that index must not panic.
        ch.commit_wait.commit_index(1);
    }

    #[test]
    fn destroy_mid_wait_returns_stopped_promptly() {
        let ch = Channel::new(leader_config(1, vec![1, 2, 3]), options(1)).unwrap();
        let waiter = {
            let ch = ch.clone();
            std::thread::spawn(move || {
                ch.propose_and_wait_commits(
                    vec![Bytes::from_static(b"doomed")],
                    Duration::from_secs(10),
                )
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        let destroy_at = Instant::now();
        ch.make_destroy();
        let result = waiter.join().expect("join");
        assert_eq!(result.unwrap_err(), ClusterError::Stopped);
        assert!(destroy_at.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn make_destroy_is_idempotent_and_terminal() {
        let ch = Channel::new(leader_config(1, vec![1]), options(1)).unwrap();
        ch.make_destroy();
        ch.make_destroy();
        ch.make_destroy();

        assert_eq!(
            ch.handle_message(ReplicaMessage::Heartbeat {
                from: 2,
                term: 1,
                committed_index: 0
            })
            .unwrap_err(),
            ClusterError::Destroyed
        );
        assert_eq!(
            ch.propose(Bytes::from_static(b"x")).unwrap_err(),
            ClusterError::Destroyed
        );
        assert!(!ch.has_ready());
    }

    #[test]
    fn inbound_queue_overflows_into_queue_full() {
        let config = Config {
            receive_queue_length: 2,
            ..Default::default()
        };
        let ch = Channel::new(leader_config(1, vec![1]), options_with(1, config)).unwrap();
        let msg = || ReplicaMessage::Heartbeat {
            from: 2,
            term: 1,
            committed_index: 0,
        };
        ch.handle_message(msg()).unwrap();
        ch.handle_message(msg()).unwrap();
        assert_eq!(ch.handle_message(msg()).unwrap_err(), ClusterError::QueueFull);
    }

    #[test]
    fn pipelined_appends_commit_in_order() {
        let ch = Channel::new(leader_config(1, vec![1]), options(1)).unwrap();
        // Two appends issued back to back, completions re-entering through
        // the append queue; both commit and apply never outruns append.
        ch.propose(Bytes::from_static(b"one")).unwrap();
        ch.propose(Bytes::from_static(b"two")).unwrap();
        let mut appends = Vec::new();
        for action in ch.ready() {
            if let Action::StoreAppend { logs } = action {
                appends.push(logs);
            }
        }
        assert_eq!(appends.len(), 2);

        for logs in appends {
            ch.handle_store_append(logs);
        }
        ch.handle_local_store_msgs().unwrap();
        assert_eq!(ch.committed_index(), 2);
        assert_eq!(ch.applied_index(), 0);
        drain(&ch);
        assert_eq!(ch.applied_index(), 2);
    }

    #[test]
    fn update_cluster_config_switches_roles_and_notifies() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let config = Config {
            node_id: 1,
            ..Default::default()
        };
        let opts = Arc::new(
            Options::new(
                config,
                Arc::new(MemoryLogStorage::new()),
                Arc::new(MemoryMetadataStorage::new()),
            )
            .with_on_leader_change(Arc::new(move |_key, leader| {
                seen_cb.store(leader, Ordering::SeqCst);
            })),
        );
        let ch = Channel::new(leader_config(2, vec![1, 2, 3]), opts).unwrap();
        assert!(!ch.is_leader());

        ch.update_cluster_config(ChannelClusterConfig {
            channel_id: "general".to_string(),
            channel_type: 2,
            term: 2,
            leader_id: 1,
            replicas: vec![1, 2, 3],
        })
        .unwrap();
        assert!(ch.is_leader());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn meta_apply_callback_sees_committed_range() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let applied_cb = applied.clone();
        let config = Config {
            node_id: 1,
            ..Default::default()
        };
        let opts = Arc::new(
            Options::new(
                config,
                Arc::new(MemoryLogStorage::new()),
                Arc::new(MemoryMetadataStorage::new()),
            )
            .with_on_channel_meta_apply(Arc::new(move |_id, _type, logs| {
                applied_cb
                    .lock()
                    .expect("applied lock")
                    .extend(logs.iter().map(|log| log.index));
                Ok(())
            })),
        );
        let ch = Channel::new(leader_config(1, vec![1]), opts).unwrap();
        ch.propose(Bytes::from_static(b"meta")).unwrap();
        drain(&ch);
        assert_eq!(*applied.lock().expect("applied lock"), vec![1]);
    }
}
