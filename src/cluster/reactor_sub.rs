//! One reactor shard: a dedicated loop draining readys and serializing
//! steps for the disjoint set of channels it owns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{Receiver, Sender, after, bounded, tick};

use super::channel::Channel;
use super::channel_list::ChannelList;
use super::error::ClusterError;
use super::message::ReplicaMessage;
use super::reactor::ReactorShared;
use super::replica::Action;

/// Capacity of the per-shard step queue; submitters block (with a shutdown
/// escape) once it fills.
const STEP_QUEUE_DEPTH: usize = 1024;

pub(crate) struct StepRequest {
    pub ch: Arc<Channel>,
    pub msg: ReplicaMessage,
    pub wait_tx: Option<Sender<Result<(), ClusterError>>>,
}

/// Shared handle to one shard: its channel set and the queues feeding its
/// loop. Cloned freely; the loop thread holds one clone, submitters others.
#[derive(Clone)]
pub(crate) struct SubHandle {
    pub index: usize,
    pub channels: Arc<ChannelList>,
    advance_tx: Sender<()>,
    advance_rx: Receiver<()>,
    step_tx: Sender<StepRequest>,
    step_rx: Receiver<StepRequest>,
    stopped: Arc<AtomicBool>,
    stop_rx: Receiver<()>,
}

impl SubHandle {
    pub(crate) fn new(index: usize, stopped: Arc<AtomicBool>, stop_rx: Receiver<()>) -> Self {
        let (advance_tx, advance_rx) = bounded(1);
        let (step_tx, step_rx) = bounded(STEP_QUEUE_DEPTH);
        Self {
            index,
            channels: Arc::new(ChannelList::new()),
            advance_tx,
            advance_rx,
            step_tx,
            step_rx,
            stopped,
            stop_rx,
        }
    }

    pub(crate) fn advance_tx(&self) -> Sender<()> {
        self.advance_tx.clone()
    }

    /// Non-blocking wake; coalesces with any pending wake.
    pub(crate) fn advance(&self) {
        let _ = self.advance_tx.try_send(());
    }

    /// Fire-and-forget step, serialized through the shard loop. Blocks only
    /// while the step queue is full.
    pub(crate) fn step(&self, ch: Arc<Channel>, msg: ReplicaMessage) -> Result<(), ClusterError> {
        let req = StepRequest {
            ch,
            msg,
            wait_tx: None,
        };
        let result = crossbeam::select! {
            send(self.step_tx, req) -> res => res.map_err(|_| ClusterError::ReactorStopped),
            recv(self.stop_rx) -> _ => Err(ClusterError::ReactorStopped),
        };
        self.advance();
        result
    }

    /// Step and wait for the replica's verdict, up to `timeout`.
    pub(crate) fn step_wait(
        &self,
        ch: Arc<Channel>,
        msg: ReplicaMessage,
        timeout: std::time::Duration,
    ) -> Result<(), ClusterError> {
        let (wait_tx, wait_rx) = bounded(1);
        let req = StepRequest {
            ch,
            msg,
            wait_tx: Some(wait_tx),
        };
        crossbeam::select! {
            send(self.step_tx, req) -> res => {
                if res.is_err() {
                    return Err(ClusterError::ReactorStopped);
                }
            }
            recv(self.stop_rx) -> _ => return Err(ClusterError::ReactorStopped),
        }
        self.advance();

        let timeout_rx = after(timeout);
        crossbeam::select! {
            recv(wait_rx) -> res => res.unwrap_or(Err(ClusterError::ReactorStopped)),
            recv(timeout_rx) -> _ => Err(ClusterError::Timeout),
            recv(self.stop_rx) -> _ => Err(ClusterError::ReactorStopped),
        }
    }
}

/// The shard loop: drain readys, then wait for a tick, a wake, a step or
/// shutdown.
pub(crate) fn run_sub_loop(handle: SubHandle, shared: Arc<ReactorShared>) {
    let ticker = tick(shared.opts().config.heartbeat());
    loop {
        if handle.stopped.load(Ordering::Acquire) {
            return;
        }
        readys(&handle, &shared);
        crossbeam::select! {
            recv(ticker) -> _ => ticks(&handle),
            recv(handle.advance_rx) -> res => {
                if res.is_err() {
                    return;
                }
            }
            recv(handle.step_rx) -> req => match req {
                Ok(req) => {
                    let result = req.ch.step_lock(req.msg);
                    match req.wait_tx {
                        Some(wait_tx) => {
                            let _ = wait_tx.try_send(result);
                        }
                        None => {
                            if let Err(err) = result {
                                tracing::warn!(
                                    target: "cluster",
                                    channel = %req.ch.key(),
                                    shard = handle.index,
                                    "step failed: {err}"
                                );
                            }
                        }
                    }
                }
                Err(_) => return,
            },
            recv(handle.stop_rx) -> _ => return,
        }
    }
}

fn readys(handle: &SubHandle, shared: &Arc<ReactorShared>) {
    for ch in handle.channels.snapshot() {
        if handle.stopped.load(Ordering::Acquire) {
            return;
        }
        if ch.is_destroyed() {
            continue;
        }
        let _ = ch.handle_received_messages();
        if let Err(err) = ch.handle_local_store_msgs() {
            tracing::warn!(
                target: "cluster",
                channel = %ch.key(),
                "local store drain failed: {err}"
            );
        }
        if ch.has_ready() {
            handle_ready(&ch, shared);
        }
    }
}

fn ticks(handle: &SubHandle) {
    for ch in handle.channels.snapshot() {
        if handle.stopped.load(Ordering::Acquire) {
            return;
        }
        ch.tick();
    }
}

fn handle_ready(ch: &Arc<Channel>, shared: &Arc<ReactorShared>) {
    for action in ch.ready() {
        tracing::trace!(
            target: "cluster",
            channel = %ch.key(),
            action = action.kind(),
            "channel action"
        );
        match action {
            Action::Init => shared.add_init_req(ch.clone()),
            Action::PayloadDecrypt { messages } => {
                shared.add_payload_decrypt_req(ch.clone(), messages);
            }
            Action::PermissionCheck { messages } => {
                shared.add_permission_req(ch.clone(), messages);
            }
            Action::Storage { messages } => shared.add_storage_req(ch.clone(), messages),
            Action::Deliver { messages, tag_key } => {
                shared.add_deliver_req(ch.clone(), messages, tag_key);
            }
            Action::Sendack { messages } => shared.add_sendack_req(ch.clone(), messages),
            Action::Forward {
                messages,
                leader_id,
            } => shared.add_forward_req(ch.clone(), messages, leader_id),
            Action::StoreAppend { logs } => ch.handle_store_append(logs),
            Action::ApplyLogs {
                applied_index,
                committed_index,
            } => ch.handle_apply_logs_req(applied_index, committed_index),
            Action::Send { to, message } => shared.send_wire(ch, to, message),
        }
    }
}
