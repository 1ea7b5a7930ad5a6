//! The per-channel replicated state machine.
//!
//! A `ChannelReplica` is stepped with local and remote events and accumulates
//! side-effecting actions which the reactor drains via `ready()` and
//! performs on the replica's behalf. The replica itself never does IO: log
//! persistence, apply, wire sends and pipeline stages all happen outside and
//! report back through further steps.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use rand::Rng;

use crate::metrics;

use super::error::ClusterError;
use super::key::{ChannelKey, NO_LEADER, NodeId};
use super::log::{self, LogEntry};
use super::message::{ChannelMessage, PipelineStage, ReplicaMessage};

/// Entries kept in memory for follower catch-up. Anything older must come
/// from the outer snapshot path.
const MAX_LOG_WINDOW: usize = 1024;

/// Log entries shipped per sync response.
const MAX_SYNC_BATCH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

/// A side-effect request produced by `ready()`.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Load channel info before processing any messages.
    Init,

    /// Persist the given logs locally, then step `StoreAppendResp`.
    StoreAppend { logs: Vec<LogEntry> },

    /// Apply the committed range `(applied_index, committed_index]`, then
    /// step `ApplyLogsResp`.
    ApplyLogs {
        applied_index: u64,
        committed_index: u64,
    },

    PayloadDecrypt {
        messages: Vec<ChannelMessage>,
    },
    PermissionCheck {
        messages: Vec<ChannelMessage>,
    },
    Storage {
        messages: Vec<ChannelMessage>,
    },
    Deliver {
        messages: Vec<ChannelMessage>,
        tag_key: Option<String>,
    },
    Sendack {
        messages: Vec<ChannelMessage>,
    },
    Forward {
        messages: Vec<ChannelMessage>,
        leader_id: NodeId,
    },

    /// Ship a wire-bound replica message to a peer.
    Send { to: NodeId, message: ReplicaMessage },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Init => "init",
            Action::StoreAppend { .. } => "store_append",
            Action::ApplyLogs { .. } => "apply_logs",
            Action::PayloadDecrypt { .. } => "payload_decrypt",
            Action::PermissionCheck { .. } => "permission_check",
            Action::Storage { .. } => "storage",
            Action::Deliver { .. } => "deliver",
            Action::Sendack { .. } => "sendack",
            Action::Forward { .. } => "forward",
            Action::Send { .. } => "send",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessagePhase {
    Received,
    Decrypted,
    Checked,
    Stored,
    Delivered,
}

struct Conduct {
    msg: ChannelMessage,
    phase: MessagePhase,
    inflight: bool,
}

pub struct ChannelReplica {
    node_id: NodeId,
    key: ChannelKey,
    replicas: Vec<NodeId>,

    role: Role,
    term: u32,
    leader_id: NodeId,
    voted_for: Option<NodeId>,
    votes: BTreeSet<NodeId>,

    last_log_index: u64,
    last_log_term: u32,
    /// Durable local append watermark. Commit and apply never pass it.
    stored_index: u64,
    committed_index: u64,
    applied_index: u64,
    apply_inflight: bool,
    /// First index of the current leadership; entries below it are from
    /// earlier terms and only commit transitively.
    term_start_index: u64,

    match_index: BTreeMap<NodeId, u64>,
    pushed_index: BTreeMap<NodeId, u64>,
    window: VecDeque<LogEntry>,

    election_elapsed: u32,
    randomized_timeout: u32,
    election_timeout_tick: u32,

    actions: Vec<Action>,

    initialized: bool,
    init_inflight: bool,
    receiver_tag_key: Option<String>,
    max_ready_batch: usize,
    conducts: VecDeque<Conduct>,
}

fn randomized_timeout(election_timeout_tick: u32) -> u32 {
    let base = election_timeout_tick.max(1);
    base + rand::rng().random_range(0..base)
}

impl ChannelReplica {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        key: ChannelKey,
        replicas: Vec<NodeId>,
        applied_index: u64,
        last_log_index: u64,
        last_log_term: u32,
        election_timeout_tick: u32,
        max_ready_batch: usize,
    ) -> Self {
        let applied_index = applied_index.min(last_log_index);
        Self {
            node_id,
            key,
            replicas,
            role: Role::Follower,
            term: last_log_term,
            leader_id: NO_LEADER,
            voted_for: None,
            votes: BTreeSet::new(),
            last_log_index,
            last_log_term,
            stored_index: last_log_index,
            committed_index: applied_index,
            applied_index,
            apply_inflight: false,
            term_start_index: last_log_index + 1,
            match_index: BTreeMap::new(),
            pushed_index: BTreeMap::new(),
            window: VecDeque::new(),
            election_elapsed: 0,
            randomized_timeout: randomized_timeout(election_timeout_tick),
            election_timeout_tick,
            actions: Vec::new(),
            initialized: false,
            init_inflight: false,
            receiver_tag_key: None,
            max_ready_batch,
            conducts: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn term(&self) -> u32 {
        self.term
    }

    pub fn leader_id(&self) -> NodeId {
        self.leader_id
    }

    pub fn last_log_index(&self) -> u64 {
        self.last_log_index
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn stored_index(&self) -> u64 {
        self.stored_index
    }

    pub fn receiver_tag_key(&self) -> Option<&str> {
        self.receiver_tag_key.as_deref()
    }

    pub fn set_replicas(&mut self, replicas: Vec<NodeId>) {
        self.replicas = replicas;
        self.match_index.retain(|node, _| self.replicas.contains(node));
        self.pushed_index.retain(|node, _| self.replicas.contains(node));
    }

    fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicas
            .iter()
            .copied()
            .filter(move |node| *node != self.node_id)
    }

    fn quorum(&self) -> usize {
        let members = self.peers().count() + 1;
        members / 2 + 1
    }

    /// Peeks whether `ready()` would return anything.
    pub fn has_ready(&self) -> bool {
        !self.actions.is_empty()
    }

    /// Drains the actions accumulated since the last ready.
    pub fn ready(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn step(&mut self, msg: ReplicaMessage) -> Result<(), ClusterError> {
        self.dispatch(msg)?;
        self.post_step();
        Ok(())
    }

    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                for peer in self.peers().collect::<Vec<_>>() {
                    self.send(
                        peer,
                        ReplicaMessage::Heartbeat {
                            from: self.node_id,
                            term: self.term,
                            committed_index: self.committed_index,
                        },
                    );
                }
            }
            Role::Follower => {
                self.election_elapsed += 1;
                if self.leader_id != NO_LEADER
                    && self.leader_id != self.node_id
                    && self.stored_index == self.last_log_index
                {
                    self.send(
                        self.leader_id,
                        ReplicaMessage::Sync {
                            from: self.node_id,
                            index: self.stored_index + 1,
                        },
                    );
                }
                if self.election_elapsed >= self.randomized_timeout {
                    self.start_election();
                }
            }
            Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_timeout {
                    self.start_election();
                }
            }
        }
        self.post_step();
    }

    fn dispatch(&mut self, msg: ReplicaMessage) -> Result<(), ClusterError> {
        match msg {
            ReplicaMessage::Propose { logs } => self.handle_propose(logs),
            ReplicaMessage::AppointLeaderReq { term, leader_id } => {
                if leader_id == self.node_id {
                    self.become_leader(term);
                } else {
                    self.become_follower(term, leader_id);
                }
                Ok(())
            }
            ReplicaMessage::BecomeLeader { term } => {
                self.become_leader(term);
                Ok(())
            }
            ReplicaMessage::BecomeFollower { term, leader_id } => {
                self.become_follower(term, leader_id);
                Ok(())
            }
            ReplicaMessage::Sync { from, index } => {
                self.handle_sync(from, index);
                Ok(())
            }
            ReplicaMessage::SyncResp {
                from,
                term,
                prev_log_index,
                prev_log_term,
                committed_index,
                logs,
                ..
            } => self.handle_sync_resp(
                from,
                term,
                prev_log_index,
                prev_log_term,
                committed_index,
                logs,
            ),
            ReplicaMessage::StoreAppendResp { index } => {
                self.handle_store_append_resp(index);
                Ok(())
            }
            ReplicaMessage::ApplyLogsResp { applied_index } => {
                self.applied_index = self.applied_index.max(applied_index);
                self.apply_inflight = false;
                Ok(())
            }
            ReplicaMessage::Vote {
                from,
                term,
                last_log_index,
                last_log_term,
            } => {
                self.handle_vote(from, term, last_log_index, last_log_term);
                Ok(())
            }
            ReplicaMessage::VoteResp {
                from,
                term,
                granted,
            } => {
                self.handle_vote_resp(from, term, granted);
                Ok(())
            }
            ReplicaMessage::Heartbeat {
                from,
                term,
                committed_index,
            } => {
                self.handle_heartbeat(from, term, committed_index);
                Ok(())
            }
            ReplicaMessage::HeartbeatResp { term, .. } => {
                if term > self.term {
                    self.become_follower(term, NO_LEADER);
                }
                Ok(())
            }
            ReplicaMessage::Tick => {
                self.tick();
                Ok(())
            }
            ReplicaMessage::MessagesReceived { messages } => {
                for msg in messages {
                    self.conducts.push_back(Conduct {
                        msg,
                        phase: MessagePhase::Received,
                        inflight: false,
                    });
                }
                Ok(())
            }
            ReplicaMessage::InitResp { tag_key } => {
                self.initialized = true;
                self.init_inflight = false;
                self.receiver_tag_key = tag_key;
                Ok(())
            }
            ReplicaMessage::PayloadDecryptResp { messages } => {
                self.complete_stage(messages, MessagePhase::Received, MessagePhase::Decrypted);
                Ok(())
            }
            ReplicaMessage::PermissionCheckResp { messages, denied } => {
                if !denied.is_empty() {
                    tracing::info!(
                        target: "cluster",
                        channel = %self.key,
                        denied = denied.len(),
                        "messages dropped by permission check"
                    );
                    self.remove_conducts(&denied);
                }
                self.complete_stage(messages, MessagePhase::Decrypted, MessagePhase::Checked);
                Ok(())
            }
            ReplicaMessage::StorageResp { messages } => {
                self.complete_stage(messages, MessagePhase::Checked, MessagePhase::Stored);
                Ok(())
            }
            ReplicaMessage::DeliverResp { message_ids } => {
                self.complete_stage_ids(
                    &message_ids,
                    MessagePhase::Stored,
                    MessagePhase::Delivered,
                );
                Ok(())
            }
            ReplicaMessage::SendackResp { message_ids } => {
                self.remove_conducts(&message_ids);
                Ok(())
            }
            ReplicaMessage::ForwardResp { message_ids } => {
                self.remove_conducts(&message_ids);
                Ok(())
            }
            ReplicaMessage::PipelineFailed { stage, message_ids } => {
                if stage == PipelineStage::Init {
                    self.init_inflight = false;
                } else {
                    self.clear_inflight(&message_ids);
                }
                Ok(())
            }
        }
    }

    fn handle_propose(&mut self, mut logs: Vec<LogEntry>) -> Result<(), ClusterError> {
        if self.role != Role::Leader {
            return Err(ClusterError::NotLeader {
                leader_id: self.leader_id,
            });
        }
        if logs.is_empty() {
            return Err(ClusterError::invalid_message("propose with no logs"));
        }
        if !log::is_contiguous(&logs, self.last_log_index + 1) {
            return Err(ClusterError::invalid_message(format!(
                "propose indices must continue at {}, got {}",
                self.last_log_index + 1,
                logs[0].index
            )));
        }
        for log in &mut logs {
            log.term = self.term;
        }
        self.last_log_index = logs.last().map(|log| log.index).unwrap_or(0);
        self.last_log_term = self.term;
        self.window.extend(logs.iter().cloned());
        self.trim_window();
        self.actions.push(Action::StoreAppend { logs });
        self.push_sync_to_lagging();
        Ok(())
    }

    /// Leader side of the follower pull. `index` is the next entry the
    /// follower needs, so `index - 1` is durably stored there.
    fn handle_sync(&mut self, from: NodeId, index: u64) {
        if self.role != Role::Leader {
            return;
        }
        metrics::msg_sync_in(1);
        self.match_index.insert(from, index.saturating_sub(1));
        // A re-request below what we already pushed means the push was lost
        // or rejected; allow re-shipping from the acked point.
        let pushed = self.pushed_index.entry(from).or_insert(0);
        if *pushed >= index {
            *pushed = index.saturating_sub(1);
        }
        self.advance_commit();
        if index <= self.last_log_index {
            self.push_sync_range(from, index);
        }
    }

    fn push_sync_to_lagging(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        for peer in self.peers().collect::<Vec<_>>() {
            let acked = self.match_index.get(&peer).copied().unwrap_or(0);
            let pushed = self.pushed_index.get(&peer).copied().unwrap_or(0);
            let from = acked.max(pushed) + 1;
            if from <= self.last_log_index {
                self.push_sync_range(peer, from);
            }
        }
    }

    fn push_sync_range(&mut self, to: NodeId, from: u64) {
        let logs = self.window_slice(from, MAX_SYNC_BATCH);
        let Some(last) = logs.last() else {
            tracing::warn!(
                target: "cluster",
                channel = %self.key,
                peer = to,
                from,
                "sync request below retained window, follower needs catch-up"
            );
            return;
        };
        let end = last.index;
        let prev = from - 1;
        metrics::msg_sync_resp_out(logs.len(), log::batch_bytes(&logs));
        self.send(
            to,
            ReplicaMessage::SyncResp {
                from: self.node_id,
                term: self.term,
                prev_log_index: prev,
                prev_log_term: self.term_at(prev),
                committed_index: self.committed_index,
                logs,
                trace_ids: Vec::new(),
                span_ids: Vec::new(),
            },
        );
        self.pushed_index.insert(to, end);
    }

    fn handle_sync_resp(
        &mut self,
        from: NodeId,
        term: u32,
        prev_log_index: u64,
        prev_log_term: u32,
        committed_index: u64,
        logs: Vec<LogEntry>,
    ) -> Result<(), ClusterError> {
        if term < self.term {
            return Ok(());
        }
        if term > self.term || self.role != Role::Follower || self.leader_id != from {
            self.become_follower(term, from);
        }
        self.election_elapsed = 0;
        metrics::msg_sync_resp_in(logs.len(), log::batch_bytes(&logs));

        if !logs.is_empty() {
            if prev_log_index > self.last_log_index {
                // Gap: the leader is ahead of what we hold, re-request from
                // our own tail.
                self.send(
                    from,
                    ReplicaMessage::Sync {
                        from: self.node_id,
                        index: self.last_log_index + 1,
                    },
                );
                return Ok(());
            }
            if !log::is_contiguous(&logs, prev_log_index + 1) {
                return Err(ClusterError::invalid_message(
                    "sync response logs are not contiguous",
                ));
            }
            if prev_log_index == self.last_log_index
                && prev_log_index > 0
                && prev_log_term != 0
                && self.last_log_term != 0
                && prev_log_term != self.last_log_term
            {
                // Our tail entry is from a deposed leader. Drop it and
                // re-request one entry earlier.
                self.truncate_suffix(prev_log_index - 1, 0);
                self.send(
                    from,
                    ReplicaMessage::Sync {
                        from: self.node_id,
                        index: self.last_log_index + 1,
                    },
                );
                return Ok(());
            }
            if prev_log_index < self.last_log_index {
                // The current-term leader overrides our tail.
                self.truncate_suffix(prev_log_index, prev_log_term);
            }
            let last = logs.last().expect("non-empty logs");
            self.last_log_index = last.index;
            self.last_log_term = last.term;
            self.window.extend(logs.iter().cloned());
            self.trim_window();
            self.actions.push(Action::StoreAppend { logs });
        }

        let ceiling = committed_index.min(self.last_log_index);
        if ceiling > self.committed_index {
            self.committed_index = ceiling;
        }
        Ok(())
    }

    fn truncate_suffix(&mut self, to_index: u64, new_last_term: u32) {
        self.window.retain(|log| log.index <= to_index);
        self.last_log_index = to_index;
        self.last_log_term = if new_last_term != 0 {
            new_last_term
        } else {
            self.term_at(to_index)
        };
        self.stored_index = self.stored_index.min(to_index);
        self.committed_index = self.committed_index.min(to_index);
    }

    fn handle_store_append_resp(&mut self, index: u64) {
        self.stored_index = self.stored_index.max(index).min(self.last_log_index);
        match self.role {
            Role::Leader => self.advance_commit(),
            Role::Follower => {
                // Durable ack doubles as the next pull.
                if self.leader_id != NO_LEADER
                    && self.leader_id != self.node_id
                    && self.stored_index == self.last_log_index
                {
                    self.send(
                        self.leader_id,
                        ReplicaMessage::Sync {
                            from: self.node_id,
                            index: self.stored_index + 1,
                        },
                    );
                }
            }
            Role::Candidate => {}
        }
    }

    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matches: Vec<u64> = self
            .peers()
            .map(|peer| self.match_index.get(&peer).copied().unwrap_or(0))
            .collect();
        matches.push(self.stored_index);
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = matches.get(self.quorum() - 1).copied().unwrap_or(0);
        if quorum_index > self.committed_index && quorum_index >= self.term_start_index {
            self.committed_index = quorum_index.min(self.last_log_index);
        }
    }

    fn handle_vote(&mut self, from: NodeId, term: u32, last_log_index: u64, last_log_term: u32) {
        if term < self.term {
            self.send(
                from,
                ReplicaMessage::VoteResp {
                    from: self.node_id,
                    term: self.term,
                    granted: false,
                },
            );
            return;
        }
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.role = Role::Follower;
            self.leader_id = NO_LEADER;
        }
        let up_to_date = last_log_term > self.last_log_term
            || (last_log_term == self.last_log_term && last_log_index >= self.last_log_index);
        let granted = up_to_date
            && match self.voted_for {
                None => true,
                Some(voted) => voted == from,
            };
        if granted {
            self.voted_for = Some(from);
            self.election_elapsed = 0;
        }
        self.send(
            from,
            ReplicaMessage::VoteResp {
                from: self.node_id,
                term: self.term,
                granted,
            },
        );
    }

    fn handle_vote_resp(&mut self, from: NodeId, term: u32, granted: bool) {
        if self.role != Role::Candidate || term != self.term || !granted {
            if term > self.term {
                self.become_follower(term, NO_LEADER);
            }
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            metrics::channel_election_success();
            self.become_leader(self.term);
        }
    }

    fn handle_heartbeat(&mut self, from: NodeId, term: u32, committed_index: u64) {
        if term < self.term {
            self.send(
                from,
                ReplicaMessage::HeartbeatResp {
                    from: self.node_id,
                    term: self.term,
                },
            );
            return;
        }
        if term > self.term || self.role != Role::Follower || self.leader_id != from {
            self.become_follower(term, from);
        }
        self.election_elapsed = 0;
        let ceiling = committed_index.min(self.stored_index);
        if ceiling > self.committed_index {
            self.committed_index = ceiling;
        }
        self.send(
            from,
            ReplicaMessage::HeartbeatResp {
                from: self.node_id,
                term: self.term,
            },
        );
    }

    fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.term += 1;
        self.voted_for = Some(self.node_id);
        self.votes.clear();
        self.votes.insert(self.node_id);
        self.leader_id = NO_LEADER;
        self.election_elapsed = 0;
        self.randomized_timeout = randomized_timeout(self.election_timeout_tick);
        metrics::channel_election_started();
        tracing::debug!(
            target: "cluster",
            channel = %self.key,
            term = self.term,
            "election started"
        );
        if self.peers().count() == 0 {
            metrics::channel_election_success();
            self.become_leader(self.term);
            return;
        }
        for peer in self.peers().collect::<Vec<_>>() {
            self.send(
                peer,
                ReplicaMessage::Vote {
                    from: self.node_id,
                    term: self.term,
                    last_log_index: self.last_log_index,
                    last_log_term: self.last_log_term,
                },
            );
        }
    }

    fn become_leader(&mut self, term: u32) {
        self.role = Role::Leader;
        self.term = self.term.max(term);
        self.leader_id = self.node_id;
        // A leader holds its own vote for the term it leads.
        self.voted_for = Some(self.node_id);
        self.votes.clear();
        self.term_start_index = self.last_log_index + 1;
        self.match_index.clear();
        self.pushed_index.clear();
        self.election_elapsed = 0;
        for conduct in self.conducts.iter_mut() {
            conduct.inflight = false;
        }
        tracing::info!(
            target: "cluster",
            channel = %self.key,
            term = self.term,
            "became leader"
        );
        for peer in self.peers().collect::<Vec<_>>() {
            self.send(
                peer,
                ReplicaMessage::Heartbeat {
                    from: self.node_id,
                    term: self.term,
                    committed_index: self.committed_index,
                },
            );
        }
        // Singleton replica sets commit on local durability alone.
        self.advance_commit();
    }

    fn become_follower(&mut self, term: u32, leader_id: NodeId) {
        self.role = Role::Follower;
        // Votes are per term; keep ours unless the term moves on.
        if term > self.term {
            self.voted_for = None;
        }
        self.term = self.term.max(term);
        self.leader_id = leader_id;
        self.votes.clear();
        self.match_index.clear();
        self.pushed_index.clear();
        self.election_elapsed = 0;
        self.randomized_timeout = randomized_timeout(self.election_timeout_tick);
        // Stage completions from the old role may still arrive; parked
        // in-flight flags make the messages eligible for forwarding.
        for conduct in self.conducts.iter_mut() {
            conduct.inflight = false;
        }
        tracing::debug!(
            target: "cluster",
            channel = %self.key,
            term = self.term,
            leader = leader_id,
            "became follower"
        );
    }

    fn send(&mut self, to: NodeId, message: ReplicaMessage) {
        self.actions.push(Action::Send { to, message });
    }

    fn post_step(&mut self) {
        self.maybe_emit_apply();
        self.advance_pipeline();
    }

    fn maybe_emit_apply(&mut self) {
        // Apply never outruns local durability, even when the quorum does.
        let ceiling = self.committed_index.min(self.stored_index);
        if !self.apply_inflight && ceiling > self.applied_index {
            self.actions.push(Action::ApplyLogs {
                applied_index: self.applied_index,
                committed_index: ceiling,
            });
            self.apply_inflight = true;
        }
    }

    fn advance_pipeline(&mut self) {
        if !self.initialized {
            if !self.init_inflight {
                self.actions.push(Action::Init);
                self.init_inflight = true;
            }
            return;
        }
        match self.role {
            Role::Leader => {
                let batch = self.collect_phase_batch(MessagePhase::Received);
                if !batch.is_empty() {
                    self.actions.push(Action::PayloadDecrypt { messages: batch });
                }
                let batch = self.collect_phase_batch(MessagePhase::Decrypted);
                if !batch.is_empty() {
                    self.actions.push(Action::PermissionCheck { messages: batch });
                }
                let batch = self.collect_phase_batch(MessagePhase::Checked);
                if !batch.is_empty() {
                    self.actions.push(Action::Storage { messages: batch });
                }
                let batch = self.collect_phase_batch(MessagePhase::Stored);
                if !batch.is_empty() {
                    self.actions.push(Action::Deliver {
                        messages: batch,
                        tag_key: self.receiver_tag_key.clone(),
                    });
                }
                let batch = self.collect_phase_batch(MessagePhase::Delivered);
                if !batch.is_empty() {
                    self.actions.push(Action::Sendack { messages: batch });
                }
            }
            Role::Follower | Role::Candidate => {
                if self.leader_id != NO_LEADER && self.leader_id != self.node_id {
                    let batch = self.collect_phase_batch(MessagePhase::Received);
                    if !batch.is_empty() {
                        self.actions.push(Action::Forward {
                            messages: batch,
                            leader_id: self.leader_id,
                        });
                    }
                }
            }
        }
    }

    fn collect_phase_batch(&mut self, phase: MessagePhase) -> Vec<ChannelMessage> {
        let max = self.max_ready_batch;
        let mut batch = Vec::new();
        for conduct in self.conducts.iter_mut() {
            if conduct.phase == phase && !conduct.inflight {
                conduct.inflight = true;
                batch.push(conduct.msg.clone());
                if batch.len() >= max {
                    break;
                }
            }
        }
        batch
    }

    fn complete_stage(
        &mut self,
        updated: Vec<ChannelMessage>,
        from_phase: MessagePhase,
        to_phase: MessagePhase,
    ) {
        for msg in updated {
            if let Some(conduct) = self
                .conducts
                .iter_mut()
                .find(|conduct| conduct.msg.message_id == msg.message_id)
                && conduct.phase == from_phase
                && conduct.inflight
            {
                conduct.msg = msg;
                conduct.phase = to_phase;
                conduct.inflight = false;
            }
        }
    }

    fn complete_stage_ids(&mut self, ids: &[u64], from_phase: MessagePhase, to_phase: MessagePhase) {
        for conduct in self.conducts.iter_mut() {
            if ids.contains(&conduct.msg.message_id)
                && conduct.phase == from_phase
                && conduct.inflight
            {
                conduct.phase = to_phase;
                conduct.inflight = false;
            }
        }
    }

    fn remove_conducts(&mut self, ids: &[u64]) {
        self.conducts
            .retain(|conduct| !ids.contains(&conduct.msg.message_id));
    }

    fn clear_inflight(&mut self, ids: &[u64]) {
        for conduct in self.conducts.iter_mut() {
            if ids.contains(&conduct.msg.message_id) {
                conduct.inflight = false;
            }
        }
    }

    fn window_slice(&self, from: u64, max: usize) -> Vec<LogEntry> {
        self.window
            .iter()
            .filter(|log| log.index >= from)
            .take(max)
            .cloned()
            .collect()
    }

    fn term_at(&self, index: u64) -> u32 {
        if index == 0 {
            return 0;
        }
        if index == self.last_log_index {
            return self.last_log_term;
        }
        self.window
            .iter()
            .find(|log| log.index == index)
            .map(|log| log.term)
            .unwrap_or(0)
    }

    fn trim_window(&mut self) {
        let floor = if self.peers().count() == 0 {
            self.last_log_index
        } else {
            self.peers()
                .map(|peer| self.match_index.get(&peer).copied().unwrap_or(0))
                .min()
                .unwrap_or(0)
        };
        while let Some(front) = self.window.front() {
            if front.index <= floor {
                self.window.pop_front();
            } else {
                break;
            }
        }
        while self.window.len() > MAX_LOG_WINDOW {
            self.window.pop_front();
        }
    }
}
